//! Integration: the terminal pattern families end to end.

use std::time::Duration;
use weft_core::{
    Binding, BindingState, Error, Identifier, Pattern, SubscriptionState, Terminal, TerminalRole,
};
use weft_test_utils::{HARNESS_TIMEOUT, leaf_pair, wait_bound, wait_subscribed};

fn ident(name: &str) -> Identifier {
    Identifier::new(7, name, false)
}

#[tokio::test]
async fn producer_consumer_is_one_way() {
    let (server, client) = leaf_pair("plant", "shop").await;
    let producer = Terminal::create(
        &server,
        Pattern::ProducerConsumer,
        TerminalRole::Producer,
        ident("/goods"),
    )
    .unwrap();
    let mut consumer = Terminal::create(
        &client,
        Pattern::ProducerConsumer,
        TerminalRole::Consumer,
        ident("/goods"),
    )
    .unwrap();

    wait_bound(&mut consumer).await;
    // The consumer subscribes to the producer; never the other way round.
    tokio::time::timeout(HARNESS_TIMEOUT, async {
        loop {
            if producer.publish(vec![3, 1, 4]).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("producer never saw the subscription");

    let got = tokio::time::timeout(HARNESS_TIMEOUT, consumer.receive_published())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, vec![3, 1, 4]);

    // The consumer has no subscribers of its own.
    assert_eq!(consumer.publish(vec![1]), Err(Error::NotReady));
    assert_eq!(consumer.subscription_state(), SubscriptionState::Unsubscribed);
}

#[tokio::test]
async fn publish_subscribe_fans_out_to_every_binding() {
    let (server, client) = leaf_pair("pub", "subs").await;
    let publisher = Terminal::create(
        &server,
        Pattern::PublishSubscribe,
        TerminalRole::Default,
        ident("/ticker"),
    )
    .unwrap();

    let sub_one = Terminal::create(
        &client,
        Pattern::PublishSubscribe,
        TerminalRole::Default,
        ident("/display-1"),
    )
    .unwrap();
    let sub_two = Terminal::create(
        &client,
        Pattern::PublishSubscribe,
        TerminalRole::Default,
        ident("/display-2"),
    )
    .unwrap();
    let mut binding_one = Binding::create(&sub_one, ident("/ticker")).unwrap();
    let _binding_two = Binding::create(&sub_two, ident("/ticker")).unwrap();

    tokio::time::timeout(HARNESS_TIMEOUT, async {
        while binding_one.state() != BindingState::Established {
            binding_one.await_state_change().await.unwrap();
        }
    })
    .await
    .unwrap();
    tokio::time::timeout(HARNESS_TIMEOUT, async {
        loop {
            if publisher.publish(vec![0x11]).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let one = tokio::time::timeout(HARNESS_TIMEOUT, sub_one.receive_published())
        .await
        .unwrap()
        .unwrap();
    let two = tokio::time::timeout(HARNESS_TIMEOUT, sub_two.receive_published())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(one, vec![0x11]);
    assert_eq!(two, vec![0x11]);
}

#[tokio::test]
async fn cached_master_slave_replays_the_last_value() {
    let (server, client) = leaf_pair("plc", "panel").await;
    let master = Terminal::create(
        &server,
        Pattern::CachedMasterSlave,
        TerminalRole::Master,
        ident("/setpoint"),
    )
    .unwrap();

    // Cached before anyone listens.
    assert_eq!(master.publish(vec![42]), Err(Error::NotReady));
    assert_eq!(master.try_get_cached().unwrap(), vec![42]);

    let slave = Terminal::create(
        &client,
        Pattern::CachedMasterSlave,
        TerminalRole::Slave,
        ident("/setpoint"),
    )
    .unwrap();
    let replay = tokio::time::timeout(HARNESS_TIMEOUT, slave.receive_published())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replay, vec![42]);
    assert_eq!(slave.try_get_cached().unwrap(), vec![42]);
}

#[tokio::test]
async fn deaf_mute_terminals_track_matches_but_carry_nothing() {
    let (server, client) = leaf_pair("silent", "watcher").await;
    let _anchor = Terminal::create(
        &server,
        Pattern::DeafMute,
        TerminalRole::Default,
        ident("/anchor"),
    )
    .unwrap();
    let observer = Terminal::create(
        &client,
        Pattern::DeafMute,
        TerminalRole::Default,
        ident("/observer"),
    )
    .unwrap();
    let mut binding = Binding::create(&observer, ident("/anchor")).unwrap();

    tokio::time::timeout(HARNESS_TIMEOUT, async {
        while binding.state() != BindingState::Established {
            binding.await_state_change().await.unwrap();
        }
    })
    .await
    .expect("deaf-mute binding must establish");

    assert_eq!(observer.publish(vec![1]), Err(Error::WrongObjectType));
    assert_eq!(observer.receive_published().await, Err(Error::WrongObjectType));
}

#[tokio::test]
async fn destroying_a_binding_withdraws_the_subscription() {
    let (server, client) = leaf_pair("station", "listener").await;
    let mut publisher = Terminal::create(
        &server,
        Pattern::PublishSubscribe,
        TerminalRole::Default,
        ident("/news"),
    )
    .unwrap();
    let subscriber = Terminal::create(
        &client,
        Pattern::PublishSubscribe,
        TerminalRole::Default,
        ident("/reader"),
    )
    .unwrap();
    let binding = Binding::create(&subscriber, ident("/news")).unwrap();

    wait_subscribed(&mut publisher).await;
    binding.destroy().unwrap();

    tokio::time::timeout(HARNESS_TIMEOUT, async {
        while publisher.subscription_state() != SubscriptionState::Unsubscribed {
            publisher.await_subscription_state_change().await.unwrap();
        }
    })
    .await
    .expect("publisher must observe the unsubscribe");
}

#[tokio::test]
async fn terminal_ids_are_reused_only_after_the_peer_acknowledges() {
    let (server, _client) = leaf_pair("ids", "peer").await;
    let first = Terminal::create(
        &server,
        Pattern::PublishSubscribe,
        TerminalRole::Default,
        ident("/one"),
    )
    .unwrap();
    let first_id = first.id();
    first.destroy().unwrap();

    // Immediately after destroy, the id is still held pending the ack.
    let second = Terminal::create(
        &server,
        Pattern::PublishSubscribe,
        TerminalRole::Default,
        ident("/two"),
    )
    .unwrap();
    assert_ne!(second.id(), first_id);

    // Once the removal is acknowledged, the freed id comes back.  Probes
    // are kept alive so only the acknowledged id can be handed out again.
    tokio::time::timeout(HARNESS_TIMEOUT, async {
        let mut held = Vec::new();
        loop {
            let probe = Terminal::create(
                &server,
                Pattern::PublishSubscribe,
                TerminalRole::Default,
                ident(&format!("/probe-{}", held.len())),
            )
            .unwrap();
            if probe.id() == first_id {
                break;
            }
            held.push(probe);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("freed terminal id must be reused after the ack");
}

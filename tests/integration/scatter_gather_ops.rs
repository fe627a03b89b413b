//! Integration: scatter-gather operations across sessions.

use std::time::Duration;
use tokio::sync::mpsc;
use weft_core::{
    Binding, Error, GatherFlags, GatherReply, Identifier, Pattern, Terminal, TerminalRole,
};
use weft_test_utils::{HARNESS_TIMEOUT, leaf_pair};

fn ident(name: &str) -> Identifier {
    Identifier::new(9, name, false)
}

type Replies = mpsc::UnboundedReceiver<Result<GatherReply, Error>>;

/// Scatter once the responder is visible; replies land in the channel.
async fn scatter_when_ready(
    requester: &Terminal,
    payload: Vec<u8>,
    keep_going: bool,
) -> (weft_core::Id, Replies) {
    let (tx, rx) = mpsc::unbounded_channel();
    let op = tokio::time::timeout(HARNESS_TIMEOUT, async {
        loop {
            let tx = tx.clone();
            match requester.async_scatter_gather(payload.clone(), move |reply| {
                let _ = tx.send(reply);
                keep_going
            }) {
                Ok(op) => break op,
                Err(Error::NotReady) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(other) => panic!("scatter failed: {other}"),
            }
        }
    })
    .await
    .expect("responder never became visible");
    (op, rx)
}

#[tokio::test]
async fn single_responder_multi_reply_operation() {
    let (server, client) = leaf_pair("replier", "asker").await;
    let responder = Terminal::create(
        &server,
        Pattern::ScatterGather,
        TerminalRole::Default,
        ident("/calc"),
    )
    .unwrap();
    let requester = Terminal::create(
        &client,
        Pattern::ScatterGather,
        TerminalRole::Default,
        ident("/ui"),
    )
    .unwrap();
    let _binding = Binding::create(&requester, ident("/calc")).unwrap();

    let pending = responder.receive_scattered().unwrap();
    let (op, mut replies) = scatter_when_ready(&requester, vec![0xaa], true).await;

    let request = tokio::time::timeout(HARNESS_TIMEOUT, pending).await.unwrap().unwrap();
    assert_eq!(request.data, vec![0xaa]);
    responder.respond_more(request.operation_id, vec![0x01]).unwrap();
    responder.respond(request.operation_id, vec![0x02]).unwrap();

    let first = replies.recv().await.unwrap().unwrap();
    assert_eq!((first.flags, first.data), (GatherFlags::NONE, vec![0x01]));
    let last = replies.recv().await.unwrap().unwrap();
    assert!(last.flags.contains(GatherFlags::FINISHED));
    assert_eq!(last.data, vec![0x02]);

    // The operation record is gone after the finishing gather.
    assert_eq!(requester.cancel_scatter_gather(op), Err(Error::InvalidHandle));
}

#[tokio::test]
async fn ignored_requests_report_ignored_finished() {
    let (server, client) = leaf_pair("bored", "eager").await;
    let responder = Terminal::create(
        &server,
        Pattern::ScatterGather,
        TerminalRole::Default,
        ident("/target"),
    )
    .unwrap();
    let requester = Terminal::create(
        &client,
        Pattern::ScatterGather,
        TerminalRole::Default,
        ident("/origin"),
    )
    .unwrap();
    let _binding = Binding::create(&requester, ident("/target")).unwrap();

    let pending = responder.receive_scattered().unwrap();
    let (_op, mut replies) = scatter_when_ready(&requester, vec![1, 2], true).await;

    let request = tokio::time::timeout(HARNESS_TIMEOUT, pending).await.unwrap().unwrap();
    responder.ignore(request.operation_id).unwrap();

    let reply = replies.recv().await.unwrap().unwrap();
    assert!(reply.flags.contains(GatherFlags::IGNORED));
    assert!(reply.flags.contains(GatherFlags::FINISHED));
    assert!(reply.data.is_empty());
}

#[tokio::test]
async fn handler_abort_gets_one_synthetic_final_gather() {
    let (server, client) = leaf_pair("chatty", "impatient").await;
    let responder = Terminal::create(
        &server,
        Pattern::ScatterGather,
        TerminalRole::Default,
        ident("/stream"),
    )
    .unwrap();
    let requester = Terminal::create(
        &client,
        Pattern::ScatterGather,
        TerminalRole::Default,
        ident("/tap"),
    )
    .unwrap();
    let _binding = Binding::create(&requester, ident("/stream")).unwrap();

    let pending = responder.receive_scattered().unwrap();
    // The handler aborts after the first reply.
    let (_op, mut replies) = scatter_when_ready(&requester, vec![5], false).await;

    let request = tokio::time::timeout(HARNESS_TIMEOUT, pending).await.unwrap().unwrap();
    responder.respond_more(request.operation_id, vec![0x10]).unwrap();

    let first = replies.recv().await.unwrap().unwrap();
    assert_eq!(first.data, vec![0x10]);
    assert!(!first.flags.contains(GatherFlags::FINISHED));

    // Exactly one synthetic final follows the abort, flags FINISHED only.
    let synthetic = tokio::time::timeout(HARNESS_TIMEOUT, replies.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(synthetic.flags, GatherFlags::FINISHED);
    assert!(synthetic.data.is_empty());
    assert!(replies.try_recv().is_err());

    // A late reply from the responder is dropped without effect.
    responder.respond(request.operation_id, vec![0x11]).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(replies.try_recv().is_err());
}

#[tokio::test]
async fn two_responders_finish_an_operation_exactly_once() {
    let (server, client) = leaf_pair("pair", "asker").await;
    let resp_a = Terminal::create(
        &server,
        Pattern::ScatterGather,
        TerminalRole::Default,
        ident("/sensor-a"),
    )
    .unwrap();
    let resp_b = Terminal::create(
        &server,
        Pattern::ScatterGather,
        TerminalRole::Default,
        ident("/sensor-b"),
    )
    .unwrap();
    let requester = Terminal::create(
        &client,
        Pattern::ScatterGather,
        TerminalRole::Default,
        ident("/collector"),
    )
    .unwrap();
    let _bind_a = Binding::create(&requester, ident("/sensor-a")).unwrap();
    let _bind_b = Binding::create(&requester, ident("/sensor-b")).unwrap();

    let pending_a = resp_a.receive_scattered().unwrap();
    let pending_b = resp_b.receive_scattered().unwrap();

    // Wait until both responders are visible, then scatter to both.
    let (_op, mut replies) = tokio::time::timeout(HARNESS_TIMEOUT, async {
        loop {
            let (tx, rx) = mpsc::unbounded_channel();
            let tx_probe = tx.clone();
            match requester.async_scatter_gather(vec![0x33], move |reply| {
                let _ = tx_probe.send(reply);
                true
            }) {
                Ok(op) => {
                    break (op, rx);
                }
                Err(Error::NotReady) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(other) => panic!("scatter failed: {other}"),
            }
        }
    })
    .await
    .unwrap();

    // Both requests may arrive in either order; answer them both.  One
    // scatter can reach a single responder if the other was not yet
    // visible, so tolerate a lone responder.
    let req_a = tokio::time::timeout(Duration::from_secs(2), pending_a).await;
    let req_b = tokio::time::timeout(Duration::from_secs(2), pending_b).await;
    let mut expected = 0;
    if let Ok(Ok(req)) = req_a {
        resp_a.respond(req.operation_id, vec![0xa1]).unwrap();
        expected += 1;
    }
    if let Ok(Ok(req)) = req_b {
        resp_b.respond(req.operation_id, vec![0xb1]).unwrap();
        expected += 1;
    }
    assert!(expected >= 1, "at least one responder must have been targeted");

    let mut finished = 0;
    let mut total = 0;
    for _ in 0..expected {
        let reply = tokio::time::timeout(HARNESS_TIMEOUT, replies.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        total += 1;
        if reply.flags.contains(GatherFlags::FINISHED) {
            finished += 1;
        }
    }
    assert_eq!(total, expected);
    assert_eq!(finished, 1, "exactly the last gather carries FINISHED");
}

#[tokio::test]
async fn echoer_answers_service_requests() {
    let echoer = weft_echoer::Echoer::bind("127.0.0.1:0".parse().unwrap(), "gecko")
        .await
        .unwrap();
    let addr = echoer.local_addr();
    tokio::spawn(echoer.run());

    let leaf = weft_core::Leaf::connect(addr, &weft_test_utils::test_config("sg-client"))
        .await
        .unwrap();
    let client = Terminal::create(
        &leaf,
        Pattern::ServiceClient,
        TerminalRole::Client,
        Identifier::new(weft_echoer::ECHO_SIGNATURE, "/Echoers/gecko", false),
    )
    .unwrap();

    let (_op, mut replies) = scatter_when_ready(&client, vec![0xca, 0xfe], true).await;
    let reply = tokio::time::timeout(HARNESS_TIMEOUT, replies.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(reply.flags.contains(GatherFlags::FINISHED));
    assert_eq!(reply.data, vec![0xca, 0xfe]);
}

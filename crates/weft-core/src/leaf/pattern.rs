//! Terminal roles within the interaction patterns.
//!
//! The wire protocol is symmetric per pattern; asymmetry (who binds, who
//! publishes, who requests) is a local property of the terminal's role.

use weft_wire::Pattern;

/// The role a terminal plays inside its pattern.
///
/// Roles that consume or address a named counterpart bind implicitly to
/// their own identifier; the others leave binding to explicit
/// [`super::binding::Binding`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalRole {
    /// Deaf-mute, publish-subscribe and scatter-gather terminals.
    Default,
    Producer,
    Consumer,
    Master,
    Slave,
    Service,
    Client,
}

impl TerminalRole {
    /// Whether terminals of this role create an implicit binding to their
    /// own identifier.
    pub(crate) fn auto_binds(self) -> bool {
        !matches!(self, TerminalRole::Default | TerminalRole::Producer)
    }

    /// Role/pattern compatibility; a mismatch is *wrong-object-type*.
    pub(crate) fn allowed_for(self, pattern: Pattern) -> bool {
        match self {
            TerminalRole::Default => matches!(
                pattern,
                Pattern::DeafMute
                    | Pattern::PublishSubscribe
                    | Pattern::CachedPublishSubscribe
                    | Pattern::ScatterGather
            ),
            TerminalRole::Producer | TerminalRole::Consumer => matches!(
                pattern,
                Pattern::ProducerConsumer | Pattern::CachedProducerConsumer
            ),
            TerminalRole::Master | TerminalRole::Slave => {
                matches!(pattern, Pattern::MasterSlave | Pattern::CachedMasterSlave)
            }
            TerminalRole::Service | TerminalRole::Client => {
                matches!(pattern, Pattern::ServiceClient)
            }
        }
    }
}

// ClientStrategy: the dependency-injected replacement for subclass
// hooks — no inheritance needed. A ClientBehavior drives exactly one
// ClientStrategy for the lifetime of a client; everything a subclass
// would have overridden is a trait method here instead.

use async_trait::async_trait;

use crate::backend::BackendInfo;
use crate::entry::ConnectionEntry;
use crate::envelope::Payload;
use crate::ids::Cookie;

/// `Cmd` is the application-level command type a ClientBehavior
/// dispatches (distinct from the envelope `Payload`, though the two are
/// often the same concrete type in simple clients); `C` is the
/// per-connection context the strategy builds once a backend is
/// resolved.
#[async_trait]
pub trait ClientStrategy<Cmd, C>: Send + Sync {
    /// Handle a command dispatched to this client that isn't a plain
    /// envelope send — administrative commands, timers firing, and the
    /// like.
    async fn on_command(&self, command: Cmd);

    /// A connection has just become live for `cookie` against `info`;
    /// build whatever per-connection context this strategy wants
    /// attached. An error here is treated as fatal to the whole client,
    /// not just this shard.
    fn connection_up(&self, cookie: Cookie, info: &BackendInfo) -> Result<C, submerge_base::Error>;

    /// Give the strategy a chance to rewrite harvested entries before
    /// they are replayed onto a reconnected backend. Most strategies
    /// have nothing to add here.
    fn finish_reconnect<P: Payload>(&self, _entries: &mut [ConnectionEntry<P>]) {}

    /// The client as a whole is being torn down irrecoverably: every
    /// shard's connection has been or is about to be poisoned.
    /// Strategies use this to release client-lifetime resources, as
    /// opposed to any one shard's.
    fn halt_client(&self, reason: &str);
}

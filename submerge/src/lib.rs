// The top-level submerge crate: illustrative wiring of the pieces that
// live in the other workspace members. It is deliberately small — the
// hard parts (the connection coordinator, the lock, the reconnect
// protocol) all live in `submerge-net`, and this crate is not assumed
// to be the only consumer of that library.
//
// `EchoStrategy` is the simplest possible `ClientStrategy`: it attaches
// no per-connection context and never rewrites replayed entries. Real
// applications (e.g. a transaction frontend) supply their own strategy
// that rewrites history generations on `connection_up`.

use async_trait::async_trait;

use submerge_net::{BackendInfo, ClientStrategy, Cookie};

pub struct EchoStrategy;

#[async_trait]
impl ClientStrategy<(), ()> for EchoStrategy {
    async fn on_command(&self, _command: ()) {}

    fn connection_up(&self, _cookie: Cookie, _info: &BackendInfo) -> Result<(), submerge_base::Error> {
        Ok(())
    }

    fn halt_client(&self, _reason: &str) {}
}

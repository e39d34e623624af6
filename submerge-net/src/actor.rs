// ActorContext: the external collaborator that runs a client's command
// loop. The coordinator only needs "let me push a message to the
// actor, now or after a delay" — how messages are actually scheduled (a
// thread-per-actor pool, a shared multi-threaded runtime, a strictly
// single-threaded event loop) is the host application's decision.
// `LocalActorContext` is the crate's own reference implementation: a
// single mpsc channel plus tokio's timer, giving a cooperative
// single-consumer actor without requiring its own dedicated runtime
// thread.

use std::time::Duration;

use tokio::sync::mpsc;

/// Lets the coordinator push a message into an actor's inbox, either
/// immediately or after a delay. `delay` scheduling backs the resolver
/// retry backoff and the reconnect retry backoff.
pub trait ActorContext<M: Send + 'static>: Send + Sync {
    fn send(&self, message: M);
    fn send_after(&self, delay: Duration, message: M);
}

/// Reference `ActorContext`: one unbounded mpsc channel, with delayed
/// sends implemented as a detached tokio task that sleeps then forwards.
/// A dropped receiver silently drops undelivered sends rather than
/// panicking, since by that point the actor has already shut down.
#[derive(Clone)]
pub struct LocalActorContext<M: Send + 'static> {
    sender: mpsc::UnboundedSender<M>,
}

impl<M: Send + 'static> LocalActorContext<M> {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<M>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (LocalActorContext { sender }, receiver)
    }
}

impl<M: Send + 'static> ActorContext<M> for LocalActorContext<M> {
    fn send(&self, message: M) {
        let _ = self.sender.send(message);
    }

    fn send_after(&self, delay: Duration, message: M) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(message);
        });
    }
}

//! Request/response correlation.
//!
//! Every synchronous request installs a [`Continuation`] in its channel's
//! single slot and hands the caller a [`Reply`]. Dispatch completes the
//! continuation when the matching `-ok` arrives, or fails it when the
//! channel or connection goes away.

use crate::delivery::Message;
use crate::error::AmqpError;
use amqp_wire::{MethodId, QueueDeclareOk, Tune};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Payload of a successful reply
#[derive(Debug)]
pub enum MethodReply {
    /// Handshake finished with these parameters
    Connected(Tune),
    /// channel.open-ok
    ChannelOpened(u16),
    /// Replies without a payload
    Unit,
    /// queue.declare-ok
    QueueDeclared(QueueDeclareOk),
    /// queue.purge-ok / queue.delete-ok
    MessageCount(u32),
    /// basic.consume-ok / basic.cancel-ok
    ConsumerTag(String),
}

/// Typed view of a [`MethodReply`]
pub trait FromReply: Sized {
    /// Name used when the reply has the wrong shape
    const EXPECTED: &'static str;

    /// Extract the typed value, `None` on a shape mismatch
    fn from_reply(reply: MethodReply) -> Option<Self>;
}

impl FromReply for Tune {
    const EXPECTED: &'static str = "connection.open-ok";

    fn from_reply(reply: MethodReply) -> Option<Self> {
        match reply {
            MethodReply::Connected(tune) => Some(tune),
            _ => None,
        }
    }
}

impl FromReply for u16 {
    const EXPECTED: &'static str = "channel.open-ok";

    fn from_reply(reply: MethodReply) -> Option<Self> {
        match reply {
            MethodReply::ChannelOpened(id) => Some(id),
            _ => None,
        }
    }
}

impl FromReply for () {
    const EXPECTED: &'static str = "an empty reply";

    fn from_reply(reply: MethodReply) -> Option<Self> {
        match reply {
            MethodReply::Unit => Some(()),
            _ => None,
        }
    }
}

impl FromReply for QueueDeclareOk {
    const EXPECTED: &'static str = "queue.declare-ok";

    fn from_reply(reply: MethodReply) -> Option<Self> {
        match reply {
            MethodReply::QueueDeclared(ok) => Some(ok),
            _ => None,
        }
    }
}

impl FromReply for u32 {
    const EXPECTED: &'static str = "a message count";

    fn from_reply(reply: MethodReply) -> Option<Self> {
        match reply {
            MethodReply::MessageCount(count) => Some(count),
            _ => None,
        }
    }
}

impl FromReply for String {
    const EXPECTED: &'static str = "a consumer tag";

    fn from_reply(reply: MethodReply) -> Option<Self> {
        match reply {
            MethodReply::ConsumerTag(tag) => Some(tag),
            _ => None,
        }
    }
}

type ReplySender = oneshot::Sender<Result<MethodReply, AmqpError>>;

/// The pending half of a request, owned by the channel (or connection) slot
#[derive(Debug)]
pub(crate) struct Continuation {
    /// Method that installed the continuation; only its `-ok` completes it
    pub request: MethodId,
    tx: ReplySender,
    /// Message sink registered once basic.consume-ok names the tag
    pub consumer: Option<mpsc::UnboundedSender<Message>>,
}

impl Continuation {
    /// Create a continuation and the caller's reply handle
    pub fn new<T: FromReply>(request: MethodId) -> (Self, Reply<T>) {
        let (tx, rx) = oneshot::channel();
        let continuation = Self {
            request,
            tx,
            consumer: None,
        };
        (continuation, Reply::new(rx))
    }

    /// Attach the sink for a consume request
    pub fn with_consumer(mut self, sink: mpsc::UnboundedSender<Message>) -> Self {
        self.consumer = Some(sink);
        self
    }

    /// Resolve successfully; a caller that stopped waiting is not an error
    pub fn resolve(self, reply: MethodReply) {
        let _ = self.tx.send(Ok(reply));
    }

    /// Fail with `err`
    pub fn fail(self, err: AmqpError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Awaitable reply to a synchronous request
#[derive(Debug)]
pub struct Reply<T> {
    rx: oneshot::Receiver<Result<MethodReply, AmqpError>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromReply> Reply<T> {
    fn new(rx: oneshot::Receiver<Result<MethodReply, AmqpError>>) -> Self {
        Self {
            rx,
            _marker: PhantomData,
        }
    }

    fn convert(
        result: Result<Result<MethodReply, AmqpError>, oneshot::error::RecvError>,
    ) -> Result<T, AmqpError> {
        match result {
            Ok(Ok(reply)) => T::from_reply(reply).ok_or(AmqpError::UnexpectedReply(T::EXPECTED)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AmqpError::Dropped),
        }
    }

    /// Take the outcome without waiting; `None` while still pending
    pub fn try_take(&mut self) -> Option<Result<T, AmqpError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(Self::convert(Ok(result))),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(AmqpError::Dropped)),
        }
    }
}

impl<T: FromReply> Future for Reply<T> {
    type Output = Result<T, AmqpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Self::convert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> MethodId {
        MethodId {
            class_id: 50,
            method_id: 10,
        }
    }

    #[tokio::test]
    async fn test_reply_resolves() {
        let (continuation, reply) = Continuation::new::<QueueDeclareOk>(request());
        continuation.resolve(MethodReply::QueueDeclared(QueueDeclareOk {
            queue: "orders".into(),
            message_count: 0,
            consumer_count: 0,
        }));

        let ok = reply.await.unwrap();
        assert_eq!(ok.queue, "orders");
    }

    #[tokio::test]
    async fn test_reply_shape_mismatch() {
        let (continuation, reply) = Continuation::new::<QueueDeclareOk>(request());
        continuation.resolve(MethodReply::Unit);
        assert!(matches!(
            reply.await,
            Err(AmqpError::UnexpectedReply("queue.declare-ok"))
        ));
    }

    #[test]
    fn test_reply_pending_until_resolved() {
        use futures::FutureExt;

        let (continuation, mut reply) = Continuation::new::<String>(request());
        assert!((&mut reply).now_or_never().is_none());

        continuation.resolve(MethodReply::ConsumerTag("ctag".into()));
        assert_eq!(reply.now_or_never().unwrap().unwrap(), "ctag");
    }

    #[test]
    fn test_try_take() {
        let (continuation, mut reply) = Continuation::new::<u32>(request());
        assert!(reply.try_take().is_none());

        continuation.fail(AmqpError::ChannelNotFound(4));
        assert!(matches!(
            reply.try_take(),
            Some(Err(AmqpError::ChannelNotFound(4)))
        ));
    }

    #[test]
    fn test_dropped_continuation() {
        let (continuation, mut reply) = Continuation::new::<()>(request());
        drop(continuation);
        assert!(matches!(reply.try_take(), Some(Err(AmqpError::Dropped))));
    }
}

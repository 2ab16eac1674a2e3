/// Typed delivery targets registered by protocols.
///
/// A registration is a type-erased [`MessageSink`] keyed by message type:
/// it knows how to decode the raw payload and where to deliver it (queue
/// or callback), and whether the type aggregates children's messages.
use std::any::Any;

use tokio::sync::mpsc;

use crate::error::OverlayError;
use crate::message::ProtocolMessage;
use crate::token::Token;
use crate::tree::TreeNode;

/// A decoded message together with the tree node it came from.
#[derive(Debug, Clone)]
pub struct Incoming<M> {
    pub from: TreeNode,
    pub token: Token,
    pub msg: M,
}

pub(crate) struct Received {
    pub from: TreeNode,
    pub token: Token,
    pub msg: Box<dyn Any + Send>,
}

pub(crate) type Handler<M> = Box<dyn Fn(Incoming<M>) -> Result<(), OverlayError> + Send + Sync>;
pub(crate) type BatchHandler<M> =
    Box<dyn Fn(Vec<Incoming<M>>) -> Result<(), OverlayError> + Send + Sync>;

pub(crate) enum Delivery<M> {
    Queue(mpsc::UnboundedSender<Incoming<M>>),
    BatchQueue(mpsc::UnboundedSender<Vec<Incoming<M>>>),
    Handler(Handler<M>),
    BatchHandler(BatchHandler<M>),
}

pub(crate) trait MessageSink: Send + Sync {
    fn aggregate(&self) -> bool;
    fn decode(&self, raw: &[u8]) -> Result<Box<dyn Any + Send>, OverlayError>;
    fn deliver(&self, batch: Vec<Received>) -> Result<(), OverlayError>;
}

pub(crate) struct TypedSink<M> {
    delivery: Delivery<M>,
}

impl<M: ProtocolMessage> TypedSink<M> {
    pub fn new(delivery: Delivery<M>) -> Self {
        Self { delivery }
    }

    fn typed(batch: Vec<Received>) -> Result<Vec<Incoming<M>>, OverlayError> {
        batch
            .into_iter()
            .map(|r| {
                let msg = r
                    .msg
                    .downcast::<M>()
                    .map_err(|_| OverlayError::TypeMismatch(M::NAME))?;
                Ok(Incoming {
                    from: r.from,
                    token: r.token,
                    msg: *msg,
                })
            })
            .collect()
    }
}

impl<M: ProtocolMessage> MessageSink for TypedSink<M> {
    fn aggregate(&self) -> bool {
        matches!(
            self.delivery,
            Delivery::BatchQueue(_) | Delivery::BatchHandler(_)
        )
    }

    fn decode(&self, raw: &[u8]) -> Result<Box<dyn Any + Send>, OverlayError> {
        let msg: M = rmp_serde::from_slice(raw)?;
        Ok(Box::new(msg))
    }

    fn deliver(&self, batch: Vec<Received>) -> Result<(), OverlayError> {
        let batch = Self::typed(batch)?;
        match &self.delivery {
            Delivery::Queue(tx) => {
                for item in batch {
                    tx.send(item)
                        .map_err(|_| OverlayError::ChannelClosed(M::NAME))?;
                }
                Ok(())
            }
            Delivery::BatchQueue(tx) => tx
                .send(batch)
                .map_err(|_| OverlayError::ChannelClosed(M::NAME)),
            Delivery::Handler(f) => batch.into_iter().try_for_each(f),
            Delivery::BatchHandler(f) => f(batch),
        }
    }
}

use bitcoin::{BlockHash, Txid};
use parking_lot::Mutex;

/// Notification delivered to the subscribers of a [`crate::Node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The active chain has a new tip, sent once per chain update.
    ChainTipChanged { hash: BlockHash, height: u32 },
    BlockConnected { hash: BlockHash, height: u32 },
    BlockDisconnected { hash: BlockHash, height: u32 },
    /// A transaction submitted to the node entered the mempool.
    TransactionAccepted { txid: Txid },
}

/// Fan-out of [`NodeEvent`]s to unbounded channels.
///
/// Receivers that have been dropped are pruned on the next notification.
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    senders: Mutex<Vec<async_channel::Sender<NodeEvent>>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&self) -> async_channel::Receiver<NodeEvent> {
        let (sender, receiver) = async_channel::unbounded();
        self.senders.lock().push(sender);
        receiver
    }

    pub(crate) fn notify(&self, events: impl IntoIterator<Item = NodeEvent>) {
        let mut senders = self.senders.lock();
        for event in events {
            senders.retain(|sender| sender.try_send(event.clone()).is_ok());
            if senders.is_empty() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn dropped_receivers_are_pruned() {
        let subscribers = Subscribers::default();
        let kept = subscribers.subscribe();
        drop(subscribers.subscribe());

        let event = NodeEvent::ChainTipChanged {
            hash: BlockHash::all_zeros(),
            height: 7,
        };
        subscribers.notify([event.clone()]);

        assert_eq!(kept.try_recv().unwrap(), event);
        assert_eq!(subscribers.senders.lock().len(), 1);
    }
}

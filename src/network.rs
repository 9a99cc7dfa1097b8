use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::crypto::{sha256, Hash};
use crate::Result;

/// Gossip topic strings, fixed by the wire protocol
pub const TOPIC_TX_NEW: &str = "tx:new";
pub const TOPIC_SUBBLOCK: &str = "subblock";
pub const TOPIC_BLOCK: &str = "block";
pub const TOPIC_POS_VOTE: &str = "posvote";
pub const TOPIC_XS_RECEIPT: &str = "xs_receipt";
pub const TOPIC_XS_TX: &str = "xs_tx";
pub const TOPIC_VIEW_CHANGE: &str = "view_change";

/// Per-topic queue depth; the oldest undelivered message is dropped beyond it
pub const TOPIC_QUEUE_DEPTH: usize = 1024;

/// Content-hash de-duplication window
pub const DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// A message delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMsg {
    pub topic: String,
    pub sender: String,
    pub payload: Vec<u8>,
}

/// Handle to a topic subscription
///
/// Messages arrive on `receiver` in per-sender send order. `cancel`
/// detaches the subscription; the hub stops delivering on the next publish.
pub struct Subscription {
    pub receiver: Receiver<InboundMsg>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Topic-based publish/subscribe boundary
///
/// Delivery is best-effort: within one topic and one sender, messages keep
/// their send order; nothing is guaranteed across senders, and the adapter
/// never promises reliable delivery.
pub trait Network: Send + Sync {
    fn broadcast(&self, topic: &str, payload: &[u8]) -> Result<()>;
    fn subscribe(&self, topic: &str) -> Subscription;
    fn peers(&self) -> Vec<String>;
}

struct TopicQueue {
    tx: Sender<InboundMsg>,
    rx: Receiver<InboundMsg>,
    active: Arc<AtomicBool>,
}

/// In-process gossip hub
///
/// Connects the node's own components (and sibling nodes in tests) through
/// bounded per-topic queues with a drop-oldest backpressure policy, and
/// de-duplicates by content hash inside a short window.
pub struct GossipHub {
    node_id: String,
    subs: Mutex<HashMap<String, Vec<TopicQueue>>>,
    seen: Mutex<(VecDeque<(Hash, Instant)>, HashSet<Hash>)>,
    peers: Mutex<Vec<String>>,
}

impl GossipHub {
    pub fn new(node_id: impl Into<String>) -> Self {
        GossipHub {
            node_id: node_id.into(),
            subs: Mutex::new(HashMap::new()),
            seen: Mutex::new((VecDeque::new(), HashSet::new())),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_peer(&self, peer: impl Into<String>) {
        self.peers.lock().push(peer.into());
    }

    /// True when this payload was already seen inside the dedup window
    fn is_duplicate(&self, topic: &str, payload: &[u8]) -> bool {
        let mut content = topic.as_bytes().to_vec();
        content.extend_from_slice(payload);
        let digest = sha256(&content);

        let mut seen = self.seen.lock();
        let (order, index) = &mut *seen;
        let now = Instant::now();
        while let Some((hash, at)) = order.front() {
            if now.duration_since(*at) > DEDUP_WINDOW {
                index.remove(hash);
                order.pop_front();
            } else {
                break;
            }
        }
        if index.contains(&digest) {
            return true;
        }
        index.insert(digest);
        order.push_back((digest, now));
        false
    }
}

impl Network for GossipHub {
    fn broadcast(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.is_duplicate(topic, payload) {
            trace!("suppressed duplicate on {}", topic);
            return Ok(());
        }

        let mut subs = self.subs.lock();
        let queues = match subs.get_mut(topic) {
            Some(q) => q,
            None => return Ok(()),
        };
        queues.retain(|q| q.active.load(Ordering::SeqCst));

        for queue in queues.iter() {
            let msg = InboundMsg {
                topic: topic.to_string(),
                sender: self.node_id.clone(),
                payload: payload.to_vec(),
            };
            match queue.tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => {
                    // drop the oldest undelivered message to make room
                    let _ = queue.rx.try_recv();
                    if queue.tx.try_send(msg).is_err() {
                        warn!("dropping message on saturated topic {}", topic);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        debug!("broadcast {} bytes on {}", payload.len(), topic);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = bounded(TOPIC_QUEUE_DEPTH);
        let active = Arc::new(AtomicBool::new(true));
        self.subs.lock().entry(topic.to_string()).or_default().push(TopicQueue {
            tx,
            rx: rx.clone(),
            active: active.clone(),
        });
        debug!("subscribed to {}", topic);
        Subscription { receiver: rx, active }
    }

    fn peers(&self) -> Vec<String> {
        self.peers.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_subscribe_in_order() {
        let hub = GossipHub::new("node-a");
        let sub = hub.subscribe(TOPIC_TX_NEW);

        hub.broadcast(TOPIC_TX_NEW, b"first").unwrap();
        hub.broadcast(TOPIC_TX_NEW, b"second").unwrap();

        assert_eq!(sub.receiver.try_recv().unwrap().payload, b"first".to_vec());
        let second = sub.receiver.try_recv().unwrap();
        assert_eq!(second.payload, b"second".to_vec());
        assert_eq!(second.sender, "node-a");
        assert_eq!(second.topic, TOPIC_TX_NEW);
    }

    #[test]
    fn test_topics_are_isolated() {
        let hub = GossipHub::new("node-a");
        let blocks = hub.subscribe(TOPIC_BLOCK);
        hub.broadcast(TOPIC_TX_NEW, b"tx").unwrap();
        assert!(blocks.receiver.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_suppressed_within_window() {
        let hub = GossipHub::new("node-a");
        let sub = hub.subscribe(TOPIC_POS_VOTE);
        hub.broadcast(TOPIC_POS_VOTE, b"vote").unwrap();
        hub.broadcast(TOPIC_POS_VOTE, b"vote").unwrap();
        assert!(sub.receiver.try_recv().is_ok());
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn test_same_payload_different_topics_not_deduped() {
        let hub = GossipHub::new("node-a");
        let a = hub.subscribe(TOPIC_XS_TX);
        let b = hub.subscribe(TOPIC_XS_RECEIPT);
        hub.broadcast(TOPIC_XS_TX, b"payload").unwrap();
        hub.broadcast(TOPIC_XS_RECEIPT, b"payload").unwrap();
        assert!(a.receiver.try_recv().is_ok());
        assert!(b.receiver.try_recv().is_ok());
    }

    #[test]
    fn test_backpressure_drops_oldest() {
        let hub = GossipHub::new("node-a");
        let sub = hub.subscribe(TOPIC_SUBBLOCK);

        for i in 0..(TOPIC_QUEUE_DEPTH as u64 + 8) {
            hub.broadcast(TOPIC_SUBBLOCK, &i.to_le_bytes()).unwrap();
        }

        // first delivered message is no longer message 0
        let first = sub.receiver.try_recv().unwrap();
        let first_id = u64::from_le_bytes(first.payload.as_slice().try_into().unwrap());
        assert!(first_id >= 8);
    }

    #[test]
    fn test_cancelled_subscription_stops_delivery() {
        let hub = GossipHub::new("node-a");
        let sub = hub.subscribe(TOPIC_VIEW_CHANGE);
        sub.cancel();
        hub.broadcast(TOPIC_VIEW_CHANGE, b"skip proposer").unwrap();
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn test_peers_listing() {
        let hub = GossipHub::new("node-a");
        assert!(hub.peers().is_empty());
        hub.add_peer("node-b");
        assert_eq!(hub.peers(), vec!["node-b".to_string()]);
    }
}

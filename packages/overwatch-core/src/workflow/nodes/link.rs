//! Link nodes: named rendezvous between graph branches.
//!
//! `linkOut` in send mode tunnels payloads to the `linkIn` of the same name
//! (possibly in another deployed workflow). `linkCall` suspends its branch,
//! invokes the subflow anchored at the target `linkIn`, and resumes with the
//! payload a return-mode `linkOut` sends back. Call depth is bounded to keep
//! link cycles from recursing unboundedly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Duration;

use super::{CallToken, NodeCtx, NodeMsg};
use crate::queue::BoundedQueue;

/// Engine-wide rendezvous table for link nodes.
pub struct LinkRegistry {
    /// linkIn name -> that node's input queue.
    inputs: DashMap<String, Arc<BoundedQueue<NodeMsg>>>,
    /// In-flight link calls awaiting a return.
    pending: DashMap<u64, oneshot::Sender<NodeMsg>>,
    next_call: AtomicU64,
}

impl LinkRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inputs: DashMap::new(),
            pending: DashMap::new(),
            next_call: AtomicU64::new(0),
        }
    }

    /// Registers a `linkIn` anchor. The latest deployment of a name wins.
    pub fn register_in(&self, name: &str, queue: Arc<BoundedQueue<NodeMsg>>) {
        self.inputs.insert(name.to_string(), queue);
    }

    /// Removes an anchor, if this queue still owns the name.
    pub fn unregister_in(&self, name: &str, queue: &Arc<BoundedQueue<NodeMsg>>) {
        self.inputs
            .remove_if(name, |_, registered| Arc::ptr_eq(registered, queue));
    }

    /// Delivers a message to a named anchor.
    pub fn send_to(&self, name: &str, msg: NodeMsg) -> bool {
        match self.inputs.get(name) {
            Some(queue) => queue.push(msg).accepted(),
            None => false,
        }
    }

    /// Opens a call slot; the returned receiver resolves on `resolve`.
    pub fn begin_call(&self) -> (u64, oneshot::Receiver<NodeMsg>) {
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Resolves a pending call. Returns false when the call is gone
    /// (timed out or never existed).
    pub fn resolve(&self, call_id: u64, msg: NodeMsg) -> bool {
        match self.pending.remove(&call_id) {
            Some((_, tx)) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Abandons a pending call after a timeout.
    pub fn cancel_call(&self, call_id: u64) {
        self.pending.remove(&call_id);
    }

    /// Registered anchor names.
    #[must_use]
    pub fn anchor_names(&self) -> Vec<String> {
        self.inputs.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `linkIn`: forwards everything arriving at the anchor downstream.
pub(super) async fn run_in(ctx: &NodeCtx) {
    while let Some(msg) = ctx.recv().await {
        ctx.runtime
            .processed
            .fetch_add(1, Ordering::Relaxed);
        ctx.send(msg);
    }
}

/// `linkOut`: sends to the named anchor, or returns to the pending caller.
pub(super) async fn run_out(ctx: &NodeCtx) {
    let Some(name) = ctx.config_str("name").map(str::to_string) else {
        ctx.report_error("linkOut missing name");
        return;
    };
    let return_mode = ctx.config_str("mode") == Some("return");

    while let Some(msg) = ctx.recv().await {
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        if return_mode {
            match msg.call {
                Some(call) => {
                    let reply = NodeMsg {
                        payload: msg.payload,
                        call: None,
                    };
                    if !ctx.services.links.resolve(call.id, reply) {
                        log::debug!(
                            "[Workflow] {}/{} return for expired call {}",
                            ctx.workflow_id(),
                            ctx.node_id(),
                            call.id
                        );
                    }
                }
                None => {
                    // A return without a caller is a wiring problem worth surfacing.
                    ctx.report_error("linkOut in return mode received payload outside a call");
                }
            }
            continue;
        }

        if !ctx.services.links.send_to(&name, msg) {
            ctx.report_error(format!("linkIn \"{name}\" is not deployed"));
        }
    }
}

/// `linkCall`: invoke the target subflow and await its return.
pub(super) async fn run_call(ctx: &NodeCtx) {
    let Some(target) = ctx.config_str("target").map(str::to_string) else {
        ctx.report_error("linkCall missing target");
        return;
    };
    let depth_limit = ctx.services.config.workflow.link_call_depth_limit;
    let timeout = Duration::from_secs(ctx.services.config.workflow.link_call_timeout_secs);

    while let Some(msg) = ctx.recv().await {
        ctx.runtime.processed.fetch_add(1, Ordering::Relaxed);

        let depth = msg.call.map_or(0, |c| c.depth) + 1;
        if depth > depth_limit {
            ctx.report_error(format!(
                "link call depth {depth} exceeds limit {depth_limit}"
            ));
            continue;
        }

        let outer = msg.call;
        let (call_id, reply_rx) = ctx.services.links.begin_call();
        let invoke = NodeMsg {
            payload: msg.payload,
            call: Some(CallToken {
                id: call_id,
                depth,
            }),
        };
        if !ctx.services.links.send_to(&target, invoke) {
            ctx.services.links.cancel_call(call_id);
            ctx.report_error(format!("linkIn \"{target}\" is not deployed"));
            continue;
        }

        // The calling branch suspends here until the subflow returns.
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                ctx.send(NodeMsg {
                    payload: reply.payload,
                    call: outer,
                });
            }
            Ok(Err(_closed)) => {
                ctx.report_error(format!("link call {call_id} dropped without a return"));
            }
            Err(_elapsed) => {
                ctx.services.links.cancel_call(call_id);
                ctx.report_error(format!(
                    "link call to \"{target}\" timed out after {timeout:?}"
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DropPolicy;
    use crate::workflow::nodes::{GraphEvent, NodePayload};

    fn event_msg(kind: &str) -> NodeMsg {
        NodeMsg::new(NodePayload::Event(GraphEvent {
            kind: kind.to_string(),
            node_id: "test".into(),
            timestamp_ms: 0,
            payload: serde_json::Value::Null,
            frame: None,
        }))
    }

    #[test]
    fn send_to_unknown_anchor_fails() {
        let registry = LinkRegistry::new();
        assert!(!registry.send_to("missing", event_msg("x")));
    }

    #[test]
    fn registered_anchor_receives() {
        let registry = LinkRegistry::new();
        let queue = Arc::new(BoundedQueue::new(4, DropPolicy::DropOldest));
        registry.register_in("alerts", Arc::clone(&queue));
        assert!(registry.send_to("alerts", event_msg("x")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unregister_only_removes_own_queue() {
        let registry = LinkRegistry::new();
        let original = Arc::new(BoundedQueue::new(4, DropPolicy::DropOldest));
        let replacement = Arc::new(BoundedQueue::new(4, DropPolicy::DropOldest));
        registry.register_in("alerts", Arc::clone(&original));
        registry.register_in("alerts", Arc::clone(&replacement));

        // The redeployed anchor owns the name now; the old teardown is a no-op.
        registry.unregister_in("alerts", &original);
        assert!(registry.send_to("alerts", event_msg("x")));
        assert_eq!(replacement.len(), 1);
    }

    #[tokio::test]
    async fn call_resolution_round_trip() {
        let registry = LinkRegistry::new();
        let (id, rx) = registry.begin_call();
        assert!(registry.resolve(id, event_msg("reply")));
        let reply = rx.await.unwrap();
        assert!(matches!(reply.payload, NodePayload::Event(_)));
        // Second resolve for the same id finds nothing.
        assert!(!registry.resolve(id, event_msg("late")));
    }
}

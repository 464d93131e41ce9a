//! Shared harness: call managers wired to one in-process broadcast channel

#![allow(dead_code)]

use fets_call_core::{
    BroadcastHub, CallEvent, CallManager, CallManagerConfig, CallState, ChannelTransport,
    LoopbackPeerFactory, SignalEnvelope, SignalingHandler, SignalingTransport, StaffId,
    SyntheticDevices,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub type Manager = CallManager<ChannelTransport<StaffId>>;

const WAIT: Duration = Duration::from_secs(3);

/// One portal client
pub struct Node {
    pub manager: Manager,
    pub devices: Arc<SyntheticDevices>,
    pub factory: Arc<LoopbackPeerFactory>,
}

impl Node {
    pub async fn spawn(hub: &BroadcastHub, name: &str) -> Self {
        Self::spawn_with(hub, name, CallManagerConfig::default()).await
    }

    pub async fn spawn_with(hub: &BroadcastHub, name: &str, config: CallManagerConfig) -> Self {
        let devices = Arc::new(SyntheticDevices::new(name));
        let factory = Arc::new(LoopbackPeerFactory::new());
        let signaling = SignalingHandler::new(Arc::new(hub.subscribe()), StaffId::new(name));
        let manager = CallManager::new(signaling, devices.clone(), factory.clone(), config).await;
        manager.start().await.unwrap();
        Self {
            manager,
            devices,
            factory,
        }
    }

    pub fn state(&self) -> CallState<StaffId> {
        self.manager.state()
    }

    /// Wait until the published state satisfies `pred`
    pub async fn wait_for<F>(&self, what: &str, pred: F) -> CallState<StaffId>
    where
        F: Fn(&CallState<StaffId>) -> bool,
    {
        let mut rx = self.manager.watch_state();
        let waited = tokio::time::timeout(WAIT, async {
            loop {
                let state = rx.borrow_and_update().clone();
                if pred(&state) {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return state;
                }
            }
        })
        .await;
        match waited {
            Ok(state) => {
                assert!(pred(&state), "{} never reached: {what}", self.manager.local());
                state
            }
            Err(_) => panic!("{} timed out waiting for: {what}", self.manager.local()),
        }
    }
}

pub fn id(name: &str) -> StaffId {
    StaffId::new(name)
}

/// Poll `cond` until it holds
pub async fn eventually<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for: {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next event matching `pred`
pub async fn next_event<F>(
    rx: &mut broadcast::Receiver<CallEvent<StaffId>>,
    pred: F,
) -> CallEvent<StaffId>
where
    F: Fn(&CallEvent<StaffId>) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

/// Every event already delivered to `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<CallEvent<StaffId>>) -> Vec<CallEvent<StaffId>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Every envelope the wiretap has seen so far
pub async fn wiretap(spy: &ChannelTransport<StaffId>) -> Vec<SignalEnvelope<StaffId>> {
    let mut seen = Vec::new();
    while let Ok(Ok(envelope)) =
        tokio::time::timeout(Duration::from_millis(50), spy.receive()).await
    {
        seen.push(envelope);
    }
    seen
}

/// Ring `callee` from `caller` and wait until both are in the call
pub async fn connect(caller: &Node, callee: &Node) {
    let callee_id = callee.manager.local().clone();
    caller
        .manager
        .start_call(vec![callee_id.clone()], fets_call_core::CallType::Video)
        .await
        .unwrap();
    callee
        .wait_for("incoming call", |s| s.is_receiving_call())
        .await;
    callee.manager.answer_call().await.unwrap();
    let key = callee_id.to_string();
    caller
        .wait_for("remote stream from callee", move |s| {
            s.is_in_call() && s.remote_streams.contains_key(&key)
        })
        .await;
}

//! Session lifecycle: creation, keep-alive, reconnection, recovery.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::{debug, info, warn};

use crate::background::run_detached_with_timeout;
use crate::polling::PollingManager;
use crate::subscription::SubscriptionManager;
use crate::ua::{
    Connector, EndpointOptions, KeepAlive, ReconnectState, ServerState,
    SessionId, StatusCode, UaSession,
};

/// How long to wait for a close call during background disposal.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A published session reference.
pub struct SessionRef(Arc<dyn UaSession>);

impl SessionRef {
    pub fn raw(&self) -> &Arc<dyn UaSession> {
        &self.0
    }
}

impl std::ops::Deref for SessionRef {
    type Target = dyn UaSession;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

/// The atomically published current session.
///
/// Readers (polling ticks, flushes) load it afresh at every use; only
/// the session manager stores into it, under its coalescing lock.
pub struct SessionSlot {
    current: ArcSwapOption<SessionRef>,
}

impl Default for SessionSlot {
    fn default() -> Self {
        SessionSlot::new()
    }
}

impl SessionSlot {
    pub fn new() -> Self {
        SessionSlot {
            current: ArcSwapOption::from(None),
        }
    }

    pub fn load(&self) -> Option<Arc<SessionRef>> {
        self.current.load_full()
    }

    pub fn replace(
        &self,
        session: Option<Arc<dyn UaSession>>,
    ) -> Option<Arc<SessionRef>> {
        self.current
            .swap(session.map(|session| Arc::new(SessionRef(session))))
    }
}

/// Outcome reported to the reconnection-completed observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The transport kept the original session alive.
    Preserved,
    /// A new session took over; subscriptions were transferred.
    Replaced,
}

pub type ReconnectObserver = Arc<dyn Fn(ReconnectOutcome) + Send + Sync>;

struct Inner {
    connector: Arc<dyn Connector>,
    endpoint: EndpointOptions,
    slot: Arc<SessionSlot>,
    handler: Arc<dyn crate::ua::ReconnectHandler>,
    subscriptions: Arc<SubscriptionManager>,
    polling: Arc<PollingManager>,
    reconnecting: AtomicBool,
    disposed: AtomicBool,
    /// Coalesces keep-alive-triggered reconnects, completions, and
    /// forced resets.
    reconnect_lock: Mutex<()>,
    stall_ticks: AtomicU32,
    observer: Mutex<Option<ReconnectObserver>>,
}

/// Owns the transport session and drives automatic reconnection.
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoint: EndpointOptions,
        slot: Arc<SessionSlot>,
        subscriptions: Arc<SubscriptionManager>,
        polling: Arc<PollingManager>,
    ) -> Self {
        let handler = connector.reconnect_handler();
        SessionManager {
            inner: Arc::new(Inner {
                connector,
                endpoint,
                slot,
                handler,
                subscriptions,
                polling,
                reconnecting: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                reconnect_lock: Mutex::new(()),
                stall_ticks: AtomicU32::new(0),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Observer fired after a reconnect completes successfully. A failed
    /// attempt does not fire it.
    pub fn set_reconnect_observer(&self, observer: ReconnectObserver) {
        *self.inner.observer.lock().unwrap() = Some(observer);
    }

    /// Create a fresh session and publish it. Any previous session is
    /// disposed off the caller's thread.
    pub fn create(&self) -> Result<Arc<SessionRef>, StatusCode> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(StatusCode::BadSessionClosed);
        }
        let session = self.inner.connector.connect(&self.inner.endpoint)?;
        self.inner.install_keep_alive(&session);
        let published = self.inner.slot.replace(Some(session));
        self.inner.reconnecting.store(false, Ordering::Release);
        self.inner.stall_ticks.store(0, Ordering::Release);
        if let Some(old) = published {
            Inner::dispose_session(old);
        }
        self.inner.polling.start();
        Ok(self.inner.slot.load().expect("session was just published"))
    }

    pub fn current(&self) -> Option<Arc<SessionRef>> {
        self.inner.slot.load()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    pub fn has_session(&self) -> bool {
        self.inner.slot.load().is_some()
    }

    /// Called from the coordinator's health tick. Returns how many
    /// consecutive ticks have seen an unfinished reconnect.
    pub fn note_health_tick(&self) -> u32 {
        if self.inner.reconnecting.load(Ordering::Acquire) {
            self.inner.stall_ticks.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.inner.stall_ticks.store(0, Ordering::Release);
            0
        }
    }

    /// Clear a reconnect that will evidently never complete. Re-checks
    /// under the coalescing lock; a completion that won the race wins.
    pub fn try_force_reset_if_stalled(&self) -> bool {
        let _guard = self.inner.reconnect_lock.lock().unwrap();
        if self.inner.disposed.load(Ordering::Acquire) {
            return false;
        }
        if !self.inner.reconnecting.load(Ordering::Acquire) {
            return false;
        }
        warn!("reconnect handler stalled, forcing reset");
        self.inner.handler.cancel();
        self.inner.reconnecting.store(false, Ordering::Release);
        self.inner.stall_ticks.store(0, Ordering::Release);
        true
    }

    /// Tear down the session. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.handler.cancel();
        if let Some(old) = self.inner.slot.replace(None) {
            old.set_keep_alive_handler(None);
            old.set_model_change_handler(None);
            Inner::dispose_session(old);
        }
    }
}

impl Inner {
    fn install_keep_alive(self: &Arc<Self>, session: &Arc<dyn UaSession>) {
        let weak = Arc::downgrade(self);
        // Unsubscribe first so a re-installed handler is never doubled.
        session.set_keep_alive_handler(None);
        session.set_keep_alive_handler(Some(Arc::new(
            move |sender: SessionId, event: &KeepAlive| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_keep_alive(sender, event);
                }
            },
        )));
    }

    fn on_keep_alive(self: &Arc<Self>, sender: SessionId, event: &KeepAlive) {
        if !event.status.is_bad() {
            return;
        }
        if !matches!(
            event.server_state,
            ServerState::Unknown | ServerState::Failed
        ) {
            return;
        }
        // Another reconnect in progress coalesces with this one.
        let Ok(_guard) = self.reconnect_lock.try_lock() else {
            return;
        };
        if self.disposed.load(Ordering::Acquire)
            || self.reconnecting.load(Ordering::Acquire)
        {
            return;
        }
        let Some(current) = self.slot.load() else {
            return;
        };
        // A late keep-alive from a replaced session must not restart
        // recovery.
        if current.id() != sender {
            return;
        }
        if self.handler.state() != ReconnectState::Ready {
            return;
        }
        info!(status = %event.status, "keep-alive failed, reconnecting");
        let weak = Arc::downgrade(self);
        let state = self.handler.begin_reconnect(
            current.raw(),
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_reconnect_complete();
                }
            }),
        );
        if matches!(
            state,
            ReconnectState::Triggered | ReconnectState::Reconnecting
        ) {
            self.reconnecting.store(true, Ordering::Release);
        }
    }

    fn on_reconnect_complete(self: &Arc<Self>) {
        let _guard = self.reconnect_lock.lock().unwrap();
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let Some(new_session) = self.handler.session() else {
            // The handler gave up; the health loop will notice the dead
            // session and recreate the stack.
            warn!("reconnect completed without a session");
            self.reconnecting.store(false, Ordering::Release);
            return;
        };
        let current = self.slot.load();
        let outcome = if current
            .as_ref()
            .is_some_and(|current| current.id() == new_session.id())
        {
            debug!("reconnect preserved the session");
            ReconnectOutcome::Preserved
        } else {
            self.install_keep_alive(&new_session);
            let old = self.slot.replace(Some(new_session));
            if let Some(old) = old {
                old.set_keep_alive_handler(None);
                Inner::dispose_session(old);
            }
            let adopted = self.slot.load().expect("just published");
            self.subscriptions.adopt(&adopted);
            info!(session = adopted.id(), "reconnect replaced the session");
            ReconnectOutcome::Replaced
        };
        self.reconnecting.store(false, Ordering::Release);
        self.stall_ticks.store(0, Ordering::Release);
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer(outcome);
        }
    }

    /// Close a replaced session without letting a hung server stall the
    /// caller, and without surfacing its errors.
    fn dispose_session(session: Arc<SessionRef>) {
        run_detached_with_timeout("uamirror-dispose", DISPOSE_TIMEOUT, move || {
            if let Err(status) = session.close() {
                debug!(%status, "closing replaced session failed");
            }
        });
    }
}

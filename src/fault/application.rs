//! Application-layer fault simulations.
//!
//! These faults run on terminated WebSocket frames. Each one installs a
//! small interceptor on the terminator at simulation time; `enable`
//! arms it and `resolve` disarms it, at which point it behaves like the
//! pass-through. Faults that act on the connection itself
//! (`DisconnectAndSuspend`) drive the terminator directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::fault::{FaultError, FaultSimulation, FaultType, Lifecycle};
use crate::protocol::{
    decode_message, encode_nack, CodecError, MessageAction, PresenceAction, WireMessage,
};
use crate::proxy::interceptor::{Action, Direction, Interceptor, PassThroughInterceptor};
use crate::proxy::params::ConnectionParams;
use crate::proxy::ws::WebSocketTerminator;
use crate::proxy::{ProxySettings, RealtimeProxy};

/// How long `DisconnectAndSuspend` keeps rejecting upgrades before
/// connects are allowed again on their own.
pub(crate) const SUSPEND_WINDOW: Duration = Duration::from_secs(120);

/// Error code carried by fabricated NACKs. Codes in 40000..=49999 are
/// non-fatal to the client; terminal codes are never synthesized.
const NACK_ERROR_CODE: u64 = 40000;
const NACK_STATUS_CODE: u64 = 400;

/// Substituted for the client's resume token to force an upstream
/// resume failure.
const BROKEN_RESUME_TOKEN: &str = "invalid-resume-token";

/// Decode the protocol message in a frame, or None for control frames
/// and payloads the codec cannot read (those are forwarded unchanged).
fn decode_or_forward(frame: &Message) -> Option<WireMessage> {
    match decode_message(frame) {
        Ok(decoded) => Some(decoded),
        Err(CodecError::NotProtocolFrame(_)) => None,
        Err(e) => {
            debug!(error = %e, "forwarding undecodable frame unchanged");
            None
        }
    }
}

fn pass(direction: Direction, frame: Message) -> Vec<Action> {
    vec![Action::new(direction, frame)]
}

// ---------------------------------------------------------------------
// Interceptors
// ---------------------------------------------------------------------

/// What a frame-level fault is looking for.
enum FrameMatcher {
    Action(MessageAction),
    Presence(PresenceAction),
}

impl FrameMatcher {
    fn matches(&self, message: &WireMessage) -> bool {
        match self {
            FrameMatcher::Action(action) => message.action == *action,
            FrameMatcher::Presence(presence) => message.has_presence_action(*presence),
        }
    }
}

/// Drops matching client frames; the upstream never sees them.
struct SwallowInterceptor {
    matcher: FrameMatcher,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl Interceptor for SwallowInterceptor {
    async fn intercept_frame(&self, direction: Direction, frame: Message) -> Vec<Action> {
        if self.armed.load(Ordering::Relaxed) && direction == Direction::ClientToServer {
            if let Some(decoded) = decode_or_forward(&frame) {
                if self.matcher.matches(&decoded) {
                    debug!(action = ?decoded.action, "swallowing client frame");
                    return Vec::new();
                }
            }
        }
        pass(direction, frame)
    }
}

/// Answers matching client presence messages with a non-fatal NACK and
/// suppresses the original.
struct NackInterceptor {
    presence: PresenceAction,
    reason: &'static str,
    armed: Arc<AtomicBool>,
}

impl NackInterceptor {
    fn fabricate(&self, decoded: &WireMessage, frame: &Message) -> Vec<Action> {
        let binary = matches!(frame, Message::Binary(_));
        let nack = encode_nack(
            decoded,
            binary,
            NACK_ERROR_CODE,
            NACK_STATUS_CODE,
            self.reason,
        );
        debug!(
            presence = ?self.presence,
            msg_serial = ?decoded.msg_serial,
            "answering presence message with NACK"
        );
        vec![Action::new(Direction::ServerToClient, nack)]
    }
}

#[async_trait]
impl Interceptor for NackInterceptor {
    async fn intercept_frame(&self, direction: Direction, frame: Message) -> Vec<Action> {
        if self.armed.load(Ordering::Relaxed) && direction == Direction::ClientToServer {
            if let Some(decoded) = decode_or_forward(&frame) {
                if decoded.has_presence_action(self.presence) {
                    return self.fabricate(&decoded, &frame);
                }
            }
        }
        pass(direction, frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumePhase {
    /// Waiting for the first CONNECTED after enable.
    Watching,
    /// Upstream session closed; the next connect with a resume token
    /// has it stripped.
    AwaitingReconnect,
    Done,
}

/// Closes the upstream session on the first CONNECTED, then strips the
/// `resume` parameter from the reconnect so upstream forces a fresh
/// session.
struct DisconnectResumeInterceptor {
    armed: Arc<AtomicBool>,
    phase: StdMutex<ResumePhase>,
}

#[async_trait]
impl Interceptor for DisconnectResumeInterceptor {
    async fn intercept_connection(&self, mut params: ConnectionParams) -> ConnectionParams {
        if self.armed.load(Ordering::Relaxed) {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            if *phase == ResumePhase::AwaitingReconnect && params.resume().is_some() {
                params.remove("resume");
                *phase = ResumePhase::Done;
                debug!("stripped resume parameter from reconnect");
            }
        }
        params
    }

    async fn intercept_frame(&self, direction: Direction, frame: Message) -> Vec<Action> {
        if self.armed.load(Ordering::Relaxed) && direction == Direction::ServerToClient {
            if let Some(decoded) = decode_or_forward(&frame) {
                let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
                if *phase == ResumePhase::Watching && decoded.action == MessageAction::Connected {
                    *phase = ResumePhase::AwaitingReconnect;
                    debug!("closing upstream session after CONNECTED");
                    return vec![Action::close(Direction::ClientToServer)];
                }
            }
        }
        pass(direction, frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReenterPhase {
    /// Waiting for a connect attempt carrying a resume token.
    AwaitingResume,
    /// Resume failure forced; waiting for the client to re-enter.
    AwaitingEnter,
    Done,
}

/// Forces one upstream resume failure, then NACKs the client's presence
/// re-entry once so the SDK has to retry it.
struct ReenterInterceptor {
    armed: Arc<AtomicBool>,
    phase: StdMutex<ReenterPhase>,
}

#[async_trait]
impl Interceptor for ReenterInterceptor {
    async fn intercept_connection(&self, mut params: ConnectionParams) -> ConnectionParams {
        if self.armed.load(Ordering::Relaxed) {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            if *phase == ReenterPhase::AwaitingResume && params.resume().is_some() {
                params.set("resume", BROKEN_RESUME_TOKEN);
                *phase = ReenterPhase::AwaitingEnter;
                debug!("corrupted resume token to force a failed resume");
            }
        }
        params
    }

    async fn intercept_frame(&self, direction: Direction, frame: Message) -> Vec<Action> {
        if self.armed.load(Ordering::Relaxed) && direction == Direction::ClientToServer {
            if let Some(decoded) = decode_or_forward(&frame) {
                let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
                if *phase == ReenterPhase::AwaitingEnter
                    && decoded.has_presence_action(PresenceAction::Enter)
                {
                    *phase = ReenterPhase::Done;
                    let binary = matches!(frame, Message::Binary(_));
                    let nack = encode_nack(
                        &decoded,
                        binary,
                        NACK_ERROR_CODE,
                        NACK_STATUS_CODE,
                        "presence re-entry rejected",
                    );
                    debug!(msg_serial = ?decoded.msg_serial, "NACKing presence re-entry");
                    return vec![Action::new(Direction::ServerToClient, nack)];
                }
            }
        }
        pass(direction, frame)
    }
}

// ---------------------------------------------------------------------
// Simulations
// ---------------------------------------------------------------------

enum Behavior {
    /// Lifecycle transitions (re)install the pass-through.
    InstallPassThrough,
    /// Lifecycle transitions arm and disarm the installed interceptor.
    Armed(Arc<AtomicBool>),
    /// Close client sessions and reject upgrades for a window.
    Suspend,
}

struct ApplicationFaultSimulation {
    id: String,
    name: &'static str,
    fault_type: FaultType,
    terminator: Arc<WebSocketTerminator>,
    behavior: Behavior,
    lifecycle: Lifecycle,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

impl ApplicationFaultSimulation {
    fn create(
        id: String,
        name: &'static str,
        fault_type: FaultType,
        settings: ProxySettings,
        behavior: Behavior,
        interceptor: Option<Arc<dyn Interceptor>>,
    ) -> Result<Arc<dyn FaultSimulation>, FaultError> {
        let terminator = Arc::new(WebSocketTerminator::new(settings));
        if let Some(interceptor) = interceptor {
            terminator.set_interceptor(interceptor);
        }
        Ok(Arc::new(Self {
            id,
            name,
            fault_type,
            terminator,
            behavior,
            lifecycle: Lifecycle::new(),
            timer: StdMutex::new(None),
        }))
    }

    fn replace_timer(&self, handle: Option<JoinHandle<()>>) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = handle;
    }
}

#[async_trait]
impl FaultSimulation for ApplicationFaultSimulation {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn fault_type(&self) -> FaultType {
        self.fault_type
    }

    fn proxy(&self) -> &dyn RealtimeProxy {
        self.terminator.as_ref()
    }

    async fn enable(&self) -> Result<(), FaultError> {
        self.lifecycle.begin_enable()?;
        match &self.behavior {
            Behavior::InstallPassThrough => {
                self.terminator
                    .set_interceptor(Arc::new(PassThroughInterceptor));
            }
            Behavior::Armed(armed) => {
                armed.store(true, Ordering::Relaxed);
                debug!(id = %self.id, name = self.name, "fault armed");
            }
            Behavior::Suspend => {
                self.terminator.close_client_sessions();
                self.terminator.set_reject_connections(true);
                let terminator = Arc::clone(&self.terminator);
                self.replace_timer(Some(tokio::spawn(async move {
                    sleep(SUSPEND_WINDOW).await;
                    terminator.set_reject_connections(false);
                })));
                debug!(
                    id = %self.id,
                    window_secs = SUSPEND_WINDOW.as_secs(),
                    "client sessions closed; rejecting upgrades"
                );
            }
        }
        Ok(())
    }

    async fn resolve(&self) -> Result<(), FaultError> {
        self.lifecycle.begin_resolve()?;
        match &self.behavior {
            Behavior::InstallPassThrough => {
                self.terminator
                    .set_interceptor(Arc::new(PassThroughInterceptor));
            }
            Behavior::Armed(armed) => {
                armed.store(false, Ordering::Relaxed);
                debug!(id = %self.id, name = self.name, "fault disarmed");
            }
            Behavior::Suspend => {
                self.replace_timer(None);
                self.terminator.set_reject_connections(false);
                debug!(id = %self.id, "upgrades allowed again");
            }
        }
        Ok(())
    }

    async fn clean_up(&self) -> Result<(), FaultError> {
        if !self.lifecycle.destroy() {
            return Ok(());
        }
        // Timer first, then sockets.
        self.replace_timer(None);
        if let Behavior::Armed(armed) = &self.behavior {
            armed.store(false, Ordering::Relaxed);
        }
        self.terminator.set_reject_connections(false);
        self.terminator.stop().await;
        debug!(id = %self.id, "application simulation destroyed");
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------

fn armed_simulation(
    id: String,
    name: &'static str,
    fault_type: FaultType,
    settings: ProxySettings,
    build: impl FnOnce(Arc<AtomicBool>) -> Arc<dyn Interceptor>,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    let armed = Arc::new(AtomicBool::new(false));
    let interceptor = build(Arc::clone(&armed));
    ApplicationFaultSimulation::create(
        id,
        name,
        fault_type,
        settings,
        Behavior::Armed(armed),
        Some(interceptor),
    )
}

pub(crate) fn null_application_layer(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    ApplicationFaultSimulation::create(
        id,
        "NullApplicationLayerFault",
        FaultType::Nonfatal,
        settings,
        Behavior::InstallPassThrough,
        None,
    )
}

pub(crate) fn attach_unresponsive(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    armed_simulation(
        id,
        "AttachUnresponsive",
        FaultType::Nonfatal,
        settings,
        |armed| {
            Arc::new(SwallowInterceptor {
                matcher: FrameMatcher::Action(MessageAction::Attach),
                armed,
            })
        },
    )
}

pub(crate) fn detach_unresponsive(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    armed_simulation(
        id,
        "DetachUnresponsive",
        FaultType::Nonfatal,
        settings,
        |armed| {
            Arc::new(SwallowInterceptor {
                matcher: FrameMatcher::Action(MessageAction::Detach),
                armed,
            })
        },
    )
}

pub(crate) fn enter_unresponsive(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    armed_simulation(
        id,
        "EnterUnresponsive",
        FaultType::Nonfatal,
        settings,
        |armed| {
            Arc::new(SwallowInterceptor {
                matcher: FrameMatcher::Presence(PresenceAction::Enter),
                armed,
            })
        },
    )
}

pub(crate) fn enter_failed_with_nonfatal_nack(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    armed_simulation(
        id,
        "EnterFailedWithNonfatalNack",
        FaultType::Nonfatal,
        settings,
        |armed| {
            Arc::new(NackInterceptor {
                presence: PresenceAction::Enter,
                reason: "presence enter rejected",
                armed,
            })
        },
    )
}

pub(crate) fn update_failed_with_nonfatal_nack(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    armed_simulation(
        id,
        "UpdateFailedWithNonfatalNack",
        FaultType::Nonfatal,
        settings,
        |armed| {
            Arc::new(NackInterceptor {
                presence: PresenceAction::Update,
                reason: "presence update rejected",
                armed,
            })
        },
    )
}

pub(crate) fn disconnect_with_failed_resume(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    armed_simulation(
        id,
        "DisconnectWithFailedResume",
        FaultType::Nonfatal,
        settings,
        |armed| {
            Arc::new(DisconnectResumeInterceptor {
                armed,
                phase: StdMutex::new(ResumePhase::Watching),
            })
        },
    )
}

pub(crate) fn reenter_on_resume_failed(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    armed_simulation(
        id,
        "ReenterOnResumeFailed",
        FaultType::Nonfatal,
        settings,
        |armed| {
            Arc::new(ReenterInterceptor {
                armed,
                phase: StdMutex::new(ReenterPhase::AwaitingResume),
            })
        },
    )
}

pub(crate) fn disconnect_and_suspend(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    ApplicationFaultSimulation::create(
        id,
        "DisconnectAndSuspend",
        FaultType::Fatal,
        settings,
        Behavior::Suspend,
        None,
    )
}

//! WhatsApp session lifecycle as a pure state machine.
//!
//! External client events (QR received, ready, auth failure, disconnect)
//! are folded into `(state, event) -> (next state, effects)` by
//! [`transition`]. The effects are interpreted by the service controller;
//! nothing here touches the database, the registry, or the client itself,
//! so the whole lifecycle is unit-testable without a browser session.

use crate::service::ConnectionStatus;

/// Reason string persisted when the QR code is not scanned in time.
pub const QR_TIMEOUT_REASON: &str = "QR code not scanned in time";

/// Reason string persisted when the paired device logs the session out.
pub const LOGGED_OUT_REASON: &str = "logged out from device";

// ---------------------------------------------------------------------------
// States and events
// ---------------------------------------------------------------------------

/// Where a single initialization attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Client construction started, no event received yet.
    Initializing,
    /// At least one QR code has been rendered; `qr_count` tracks refreshes.
    WaitingForQr { qr_count: u32 },
    /// The phone scanned the QR; waiting for the session to become usable.
    Authenticated,
    /// Live and registered for sends.
    Connected,
    /// Session dropped without an explicit logout.
    Disconnected,
    /// Authentication rejected; operator attention required.
    AuthFailed,
    /// Abandoned because the QR was never scanned.
    TimedOut,
    /// Torn down (explicit destroy or device logout). Terminal.
    Destroyed,
}

/// Events originating from the client or from the controller's timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    QrReceived { payload: String },
    Authenticated,
    Ready,
    AuthFailure { message: String },
    Disconnected { reason: String },
    QrTimeoutFired,
    DestroyRequested,
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Side-effects the controller must perform for a transition.
///
/// Ordering within the vector is significant: handles are unregistered
/// before teardown so availability checks fail fast during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Persist a status (and optional error detail) to durable config.
    Persist {
        status: ConnectionStatus,
        error: Option<String>,
    },
    /// Render and persist the QR image for the admin UI.
    StoreQr { payload: String },
    /// Clear the persisted QR image.
    ClearQr,
    /// Arm the hard QR-scan deadline. Emitted only for the first QR of an
    /// attempt; refreshes do not extend the deadline.
    ArmQrTimeout,
    /// Cancel the armed QR-scan deadline.
    ClearQrTimeout,
    /// Publish the live handle to the service registry.
    RegisterHandle,
    /// Remove the live handle from the service registry.
    UnregisterHandle,
    /// Gracefully close the client and persist `DISABLED`.
    TearDownClient,
    /// Schedule deletion of the local auth-profile directory (delayed to
    /// dodge file locks held by the dying browser process).
    RemoveAuthProfile,
}

/// Result of folding one event into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: SessionState) -> Self {
        Self {
            next: state,
            effects: Vec::new(),
        }
    }
}

/// Whether a disconnect reason indicates an explicit logout from the
/// paired device (as opposed to a transient drop).
pub fn is_logout_reason(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("logout") || lower.contains("logged out")
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Fold one event into the session state machine.
pub fn transition(state: SessionState, event: SessionEvent) -> Transition {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        // --- QR handling ------------------------------------------------
        // First QR of the attempt arms the hard deadline; refreshes only
        // replace the stored image.
        (S::Initializing, E::QrReceived { payload }) => Transition {
            next: S::WaitingForQr { qr_count: 1 },
            effects: vec![
                Effect::StoreQr { payload },
                Effect::Persist {
                    status: ConnectionStatus::WaitingForQrScan,
                    error: None,
                },
                Effect::ArmQrTimeout,
            ],
        },
        (S::WaitingForQr { qr_count }, E::QrReceived { payload }) => Transition {
            next: S::WaitingForQr {
                qr_count: qr_count + 1,
            },
            effects: vec![Effect::StoreQr { payload }],
        },

        // --- Happy path -------------------------------------------------
        (S::Initializing | S::WaitingForQr { .. }, E::Authenticated) => Transition {
            next: S::Authenticated,
            effects: vec![Effect::Persist {
                status: ConnectionStatus::Authenticated,
                error: None,
            }],
        },
        (
            S::Initializing | S::WaitingForQr { .. } | S::Authenticated | S::Disconnected,
            E::Ready,
        ) => Transition {
            next: S::Connected,
            effects: vec![
                Effect::ClearQrTimeout,
                Effect::ClearQr,
                Effect::RegisterHandle,
                Effect::Persist {
                    status: ConnectionStatus::Connected,
                    error: None,
                },
            ],
        },

        // --- Failures ---------------------------------------------------
        (_, E::AuthFailure { message }) => Transition {
            next: S::AuthFailed,
            effects: vec![
                Effect::ClearQrTimeout,
                Effect::ClearQr,
                Effect::Persist {
                    status: ConnectionStatus::AuthFailure,
                    error: Some(message),
                },
            ],
        },
        (S::WaitingForQr { .. }, E::QrTimeoutFired) => Transition {
            next: S::TimedOut,
            effects: vec![
                Effect::ClearQr,
                Effect::Persist {
                    status: ConnectionStatus::Timeout,
                    error: Some(QR_TIMEOUT_REASON.to_string()),
                },
                Effect::TearDownClient,
            ],
        },
        // A late timer firing after the session resolved is a no-op.
        (state, E::QrTimeoutFired) => Transition::stay(state),

        // --- Disconnects ------------------------------------------------
        // Tearing the client down kills its event stream, which the
        // bridge reports as a disconnect; a finished attempt must not be
        // moved off its terminal state by that report.
        (S::Destroyed | S::TimedOut, E::Disconnected { .. }) => Transition::stay(state),
        (_, E::Disconnected { reason }) if is_logout_reason(&reason) => Transition {
            next: S::Destroyed,
            effects: vec![
                Effect::ClearQrTimeout,
                Effect::UnregisterHandle,
                Effect::RemoveAuthProfile,
                Effect::Persist {
                    status: ConnectionStatus::Disabled,
                    error: Some(LOGGED_OUT_REASON.to_string()),
                },
                Effect::TearDownClient,
            ],
        },
        (_, E::Disconnected { reason }) => Transition {
            next: S::Disconnected,
            effects: vec![
                Effect::UnregisterHandle,
                Effect::Persist {
                    status: ConnectionStatus::Disconnected,
                    error: Some(reason),
                },
            ],
        },

        // --- Explicit teardown -------------------------------------------
        (_, E::DestroyRequested) => Transition {
            next: S::Destroyed,
            effects: vec![
                Effect::ClearQrTimeout,
                Effect::UnregisterHandle,
                Effect::TearDownClient,
            ],
        },

        // Anything else (e.g. a stray QR after connect) is ignored.
        (state, _) => Transition::stay(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qr(payload: &str) -> SessionEvent {
        SessionEvent::QrReceived {
            payload: payload.to_string(),
        }
    }

    #[test]
    fn first_qr_arms_timeout() {
        let t = transition(SessionState::Initializing, qr("qr-1"));
        assert_eq!(t.next, SessionState::WaitingForQr { qr_count: 1 });
        assert!(t.effects.contains(&Effect::ArmQrTimeout));
        assert!(t.effects.contains(&Effect::StoreQr {
            payload: "qr-1".to_string()
        }));
    }

    #[test]
    fn qr_refresh_does_not_rearm_timeout() {
        let t = transition(SessionState::WaitingForQr { qr_count: 1 }, qr("qr-2"));
        assert_eq!(t.next, SessionState::WaitingForQr { qr_count: 2 });
        assert!(!t.effects.contains(&Effect::ArmQrTimeout));
        assert!(t.effects.contains(&Effect::StoreQr {
            payload: "qr-2".to_string()
        }));
    }

    #[test]
    fn ready_clears_timeout_and_registers() {
        let t = transition(
            SessionState::WaitingForQr { qr_count: 3 },
            SessionEvent::Ready,
        );
        assert_eq!(t.next, SessionState::Connected);
        let effects = t.effects;
        assert!(effects.contains(&Effect::ClearQrTimeout));
        assert!(effects.contains(&Effect::ClearQr));
        assert!(effects.contains(&Effect::RegisterHandle));
        assert!(effects.contains(&Effect::Persist {
            status: ConnectionStatus::Connected,
            error: None,
        }));
    }

    #[test]
    fn unregister_precedes_teardown_on_logout() {
        let t = transition(
            SessionState::Connected,
            SessionEvent::Disconnected {
                reason: "LOGOUT".to_string(),
            },
        );
        assert_eq!(t.next, SessionState::Destroyed);
        let unregister = t
            .effects
            .iter()
            .position(|e| *e == Effect::UnregisterHandle)
            .unwrap();
        let teardown = t
            .effects
            .iter()
            .position(|e| *e == Effect::TearDownClient)
            .unwrap();
        assert!(unregister < teardown);
        assert!(t.effects.contains(&Effect::RemoveAuthProfile));
        assert!(t.effects.contains(&Effect::Persist {
            status: ConnectionStatus::Disabled,
            error: Some(LOGGED_OUT_REASON.to_string()),
        }));
    }

    #[test]
    fn plain_disconnect_stays_reconnectable() {
        let t = transition(
            SessionState::Connected,
            SessionEvent::Disconnected {
                reason: "stream error".to_string(),
            },
        );
        // DISCONNECTED (not DISABLED) so the self-healing sweep retries.
        assert_eq!(t.next, SessionState::Disconnected);
        assert!(!t.effects.contains(&Effect::RemoveAuthProfile));
        assert!(t.effects.contains(&Effect::Persist {
            status: ConnectionStatus::Disconnected,
            error: Some("stream error".to_string()),
        }));
    }

    #[test]
    fn qr_timeout_abandons_attempt() {
        let t = transition(
            SessionState::WaitingForQr { qr_count: 2 },
            SessionEvent::QrTimeoutFired,
        );
        assert_eq!(t.next, SessionState::TimedOut);
        assert!(t.effects.contains(&Effect::TearDownClient));
        assert!(t.effects.contains(&Effect::Persist {
            status: ConnectionStatus::Timeout,
            error: Some(QR_TIMEOUT_REASON.to_string()),
        }));
    }

    #[test]
    fn late_timer_after_connect_is_noop() {
        let t = transition(SessionState::Connected, SessionEvent::QrTimeoutFired);
        assert_eq!(t.next, SessionState::Connected);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn auth_failure_is_not_retried_state() {
        let t = transition(
            SessionState::WaitingForQr { qr_count: 1 },
            SessionEvent::AuthFailure {
                message: "pairing rejected".to_string(),
            },
        );
        assert_eq!(t.next, SessionState::AuthFailed);
        assert!(t.effects.contains(&Effect::Persist {
            status: ConnectionStatus::AuthFailure,
            error: Some("pairing rejected".to_string()),
        }));
    }

    #[test]
    fn post_teardown_disconnect_keeps_terminal_state() {
        for state in [SessionState::Destroyed, SessionState::TimedOut] {
            for reason in ["event stream closed", "LOGOUT"] {
                let t = transition(
                    state,
                    SessionEvent::Disconnected {
                        reason: reason.to_string(),
                    },
                );
                assert_eq!(t.next, state, "reason={reason}");
                assert!(t.effects.is_empty(), "reason={reason}");
            }
        }
    }

    #[test]
    fn logout_reason_detection() {
        assert!(is_logout_reason("LOGOUT"));
        assert!(is_logout_reason("device logged out"));
        assert!(!is_logout_reason("stream error"));
        assert!(!is_logout_reason("NAVIGATION"));
    }

    #[test]
    fn stray_qr_after_connect_ignored() {
        let t = transition(SessionState::Connected, qr("late"));
        assert_eq!(t.next, SessionState::Connected);
        assert!(t.effects.is_empty());
    }
}

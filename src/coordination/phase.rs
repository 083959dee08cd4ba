// Bilateral Firmware - Coordination Phases

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Hub: drain the inbox, decide what runs next.
    CheckMessages,
    /// Bounded wait for the first handshake of a session.
    PairingWait,
    /// Actuator on.
    Active,
    /// Actuator off. The peer's ACTIVE window lies in here.
    Inactive,
    /// Terminal.
    Shutdown,
}

impl Phase {
    /// The explicit transition table. `Shutdown` is reachable from everywhere
    /// and leads nowhere.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) => true,
            (CheckMessages, _) => true,
            (PairingWait, CheckMessages) => true,
            (Active, Inactive | CheckMessages) => true,
            (Inactive, Active | CheckMessages) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Shutdown
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::CheckMessages => "CHECK_MESSAGES",
            Phase::PairingWait => "PAIRING_WAIT",
            Phase::Active => "ACTIVE",
            Phase::Inactive => "INACTIVE",
            Phase::Shutdown => "SHUTDOWN",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Phase; 5] = [
        Phase::CheckMessages,
        Phase::PairingWait,
        Phase::Active,
        Phase::Inactive,
        Phase::Shutdown,
    ];

    #[test]
    fn shutdown_reachable_from_every_live_phase() {
        for phase in ALL.iter().filter(|p| !p.is_terminal()) {
            assert!(phase.can_transition_to(Phase::Shutdown), "{}", phase);
        }
    }

    #[test]
    fn nothing_leaves_shutdown() {
        for next in ALL {
            assert!(!Phase::Shutdown.can_transition_to(next));
        }
    }

    #[test]
    fn pairing_wait_only_returns_to_hub() {
        assert!(Phase::PairingWait.can_transition_to(Phase::CheckMessages));
        assert!(!Phase::PairingWait.can_transition_to(Phase::Active));
        assert!(!Phase::PairingWait.can_transition_to(Phase::Inactive));
    }

    #[test]
    fn active_and_inactive_alternate() {
        assert!(Phase::Active.can_transition_to(Phase::Inactive));
        assert!(Phase::Inactive.can_transition_to(Phase::Active));
        assert!(!Phase::Active.can_transition_to(Phase::Active));
        assert!(!Phase::Active.can_transition_to(Phase::PairingWait));
    }
}

//! Two sides walking the link handshake under an arbitrary schedule.
//!
//! Each side only sees the quad its peer last pushed. A step either enters
//! the first phase or re-evaluates the mirrored quad, exactly as the async
//! driver does between polls.

use rskt_transport_shm::handshake::{evaluate, INITIAL_READ_PTR, INITIAL_WRITE_PTR};
use rskt_transport_shm::{HandshakeError, LinkFlags, Phase, QuadSnapshot, SideFlags};

#[derive(Debug, Clone, Copy, bolero::TypeGenerator)]
pub enum Step {
    /// Let side 0 or 1 (by parity) make one move.
    Poll(u8),
    /// Side 0 or 1 (by parity) raises ERROR and stops.
    Fault(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    NotStarted,
    In(Phase),
    Aborted,
    Faulted,
}

#[derive(Debug, Clone)]
struct Side {
    progress: Progress,
    local: QuadSnapshot,
}

fn rank(progress: Progress) -> u8 {
    match progress {
        Progress::NotStarted => 0,
        Progress::In(Phase::Announce) => 1,
        Progress::In(Phase::Settle) => 2,
        Progress::In(Phase::Arm) => 3,
        Progress::In(Phase::Live) => 4,
        Progress::Aborted | Progress::Faulted => 0,
    }
}

pub struct Link {
    sides: [Side; 2],
    /// `mirror[i]` is side `i`'s copy of the peer's quad.
    mirror: [QuadSnapshot; 2],
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    pub fn new() -> Self {
        let side = Side {
            progress: Progress::NotStarted,
            local: QuadSnapshot::default(),
        };
        Self {
            sides: [side.clone(), side],
            mirror: [QuadSnapshot::default(); 2],
        }
    }

    pub fn progress(&self, side: usize) -> Progress {
        self.sides[side].progress
    }

    fn push(&mut self, from: usize) {
        self.mirror[1 - from] = self.sides[from].local;
    }

    fn enter(&mut self, side: usize, phase: Phase) -> Result<(), String> {
        let peer = self.sides[1 - side].progress;
        // Stamping pointers while the peer may still zero its view loses them.
        if phase.stamps_pointers() && rank(peer) < rank(Progress::In(Phase::Settle)) && peer != Progress::Faulted {
            return Err(format!("side {side} arms while peer is {peer:?}"));
        }
        if phase == Phase::Live && rank(peer) < rank(Progress::In(Phase::Arm)) && peer != Progress::Faulted {
            return Err(format!("side {side} goes live while peer is {peer:?}"));
        }
        let me = &mut self.sides[side];
        me.progress = Progress::In(phase);
        if phase != Phase::Live {
            let flags = SideFlags::new(phase.own_flags(), me.local.write_flags.link);
            me.local.write_flags = flags;
            me.local.read_flags = flags;
            if phase.stamps_pointers() {
                me.local.write_ptr = INITIAL_WRITE_PTR;
                me.local.read_ptr = INITIAL_READ_PTR;
            }
            self.push(side);
        }
        Ok(())
    }

    /// One move by `side`. Returns whether anything changed.
    pub fn poll(&mut self, side: usize) -> Result<bool, String> {
        match self.sides[side].progress {
            Progress::NotStarted => self.enter(side, Phase::Announce).map(|()| true),
            Progress::In(Phase::Live) | Progress::Aborted | Progress::Faulted => Ok(false),
            Progress::In(phase) => match evaluate(phase, &self.mirror[side]) {
                Ok(true) => self.enter(side, phase.next()).map(|()| true),
                Ok(false) => Ok(false),
                Err(HandshakeError::Aborted { flags, .. }) if flags.contains(LinkFlags::ERROR) => {
                    self.sides[side].progress = Progress::Aborted;
                    Ok(true)
                }
                Err(e) => Err(format!("side {side} in {phase:?}: unexpected {e}")),
            },
        }
    }

    pub fn fault(&mut self, side: usize) {
        let me = &mut self.sides[side];
        if matches!(me.progress, Progress::In(Phase::Live)) {
            return;
        }
        me.progress = Progress::Faulted;
        me.local.write_flags.link |= LinkFlags::ERROR;
        me.local.read_flags.link |= LinkFlags::ERROR;
        self.push(side);
    }

    /// Alternate both sides until neither moves. A fair schedule must end
    /// with each side live, or aborted because the other faulted.
    pub fn settle(&mut self) -> Result<(), String> {
        for _ in 0..32 {
            let moved = self.poll(0)? | self.poll(1)?;
            if !moved {
                break;
            }
        }
        for side in 0..2 {
            let peer = self.progress(1 - side);
            match self.progress(side) {
                Progress::In(Phase::Live) | Progress::Faulted => {}
                Progress::Aborted if peer == Progress::Faulted => {}
                other => return Err(format!("side {side} stuck at {other:?}, peer {peer:?}")),
            }
        }
        Ok(())
    }
}

/// Run `steps` then let both sides finish.
pub fn execute_and_verify(steps: &[Step]) -> Result<(), String> {
    let mut link = Link::new();
    for (i, step) in steps.iter().enumerate() {
        match *step {
            Step::Poll(side) => {
                link.poll(side as usize % 2).map_err(|e| format!("step {i}: {e}"))?;
            }
            Step::Fault(side) => link.fault(side as usize % 2),
        }
    }
    link.settle()
}

// Resize animation
// Walks the window size one unit per axis per tick toward a target

use crate::geometry::Size;
use log::debug;
use std::time::Duration;

/// Delay between two resize steps
pub const RESIZE_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizePhase {
    Idle,
    Animating { target: Size },
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStep {
    /// Nothing in flight
    Idle,
    /// The window should take this size, more ticks follow
    Stepped(Size),
    /// Target reached, the animator went back to idle
    Settled(Size),
}

#[derive(Debug, Clone)]
pub struct ResizeAnimator {
    phase: ResizePhase,
}

impl ResizeAnimator {
    pub fn new() -> Self {
        Self {
            phase: ResizePhase::Idle,
        }
    }

    pub fn phase(&self) -> ResizePhase {
        self.phase
    }

    pub fn is_animating(&self) -> bool {
        matches!(self.phase, ResizePhase::Animating { .. })
    }

    /// Start or redirect a transition. Returns whether ticks are needed.
    pub fn request(&mut self, current: Size, target: Size) -> bool {
        match self.phase {
            ResizePhase::Idle if current == target => {
                debug!("Resize to {:?} ignored, already there", target);
                false
            }
            ResizePhase::Idle => {
                debug!("Resize animation {:?} -> {:?}", current, target);
                self.phase = ResizePhase::Animating { target };
                true
            }
            ResizePhase::Animating { target: previous } => {
                debug!("Resize animation redirected {:?} -> {:?}", previous, target);
                self.phase = ResizePhase::Animating { target };
                true
            }
        }
    }

    pub fn tick(&mut self, current: Size) -> ResizeStep {
        let ResizePhase::Animating { target } = self.phase else {
            return ResizeStep::Idle;
        };

        if current == target {
            self.phase = ResizePhase::Idle;
            return ResizeStep::Settled(current);
        }

        ResizeStep::Stepped(Size::new(
            current.width + (target.width - current.width).signum(),
            current.height + (target.height - current.height).signum(),
        ))
    }
}

impl Default for ResizeAnimator {
    fn default() -> Self {
        Self::new()
    }
}

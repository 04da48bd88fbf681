use std::collections::VecDeque;
use std::fmt;

/// Opaque identity of one emulated network controller attached to a network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerToken(pub u32);

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nic#{}", self.0)
    }
}

#[derive(Debug)]
pub struct QueuedFrame {
    pub owner: OwnerToken,
    pub data: Vec<u8>,
}

/// Frames waiting to be picked up by a controller. FIFO per owner.
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: VecDeque<QueuedFrame>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, owner: OwnerToken, data: Vec<u8>) {
        self.frames.push_back(QueuedFrame { owner, data });
    }

    /// Removes and returns the oldest frame addressed to `owner`.
    pub fn pop_for(&mut self, owner: OwnerToken) -> Option<Vec<u8>> {
        let index = self.frames.iter().position(|frame| frame.owner == owner)?;
        self.frames.remove(index).map(|frame| frame.data)
    }

    pub fn has_frame_for(&self, owner: OwnerToken) -> bool {
        self.frames.iter().any(|frame| frame.owner == owner)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

/// Byte-oriented console used by the console syscalls.
pub trait Console {
    /// Writes bytes verbatim.
    fn write_bytes(&mut self, bytes: &[u8]);
    /// Returns the next input byte without blocking.
    fn read_byte(&mut self) -> Option<u8>;
}

#[derive(Default)]
struct Buffers {
    output: Vec<u8>,
    input: VecDeque<u8>,
}

/// In-memory console; clones share the same buffers.
#[derive(Clone, Default)]
pub struct BufferConsole {
    inner: Arc<Mutex<Buffers>>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes to be returned by [`Console::read_byte`].
    pub fn push_input(&self, bytes: &[u8]) {
        self.inner.lock().input.extend(bytes.iter().copied());
    }

    /// Everything written so far.
    pub fn output(&self) -> Vec<u8> {
        self.inner.lock().output.clone()
    }
}

impl Console for BufferConsole {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.inner.lock().output.extend_from_slice(bytes);
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.inner.lock().input.pop_front()
    }
}

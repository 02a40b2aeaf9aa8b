// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, thread};

/// Produces the one background thread the client facade runs its
/// scheduler on (spec §6 "ThreadFactory"). Failure to spawn triggers
/// the inline-drive fallback rather than propagating an error.
pub trait ThreadFactory: Send + Sync {
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>) -> io::Result<thread::JoinHandle<()>>;
}

/// Spawns a real OS thread via `std::thread`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdThreadFactory;

impl ThreadFactory for StdThreadFactory {
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("svcctl-scheduler".into())
            .spawn(task)
    }
}

// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::Write;
use std::sync::{Arc, Mutex};

pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

/// Asserts two byte strings are equal, printing hex dumps on failure.
macro_rules! assert_eq_hex {
    ($left:expr, $right:expr $(,)?) => {{
        let left: &[u8] = &$left[..];
        let right: &[u8] = &$right[..];
        if left != right {
            panic!(
                "assertion failed: left == right\nleft: {:?}\nright: {:?}",
                pretty_hex::PrettyHex::hex_dump(&left),
                pretty_hex::PrettyHex::hex_dump(&right),
            );
        }
    }};
}

pub(crate) use assert_eq_hex;

/// An in-memory output sink whose contents stay readable after the
/// session takes ownership of the writer.
#[derive(Clone, Default)]
pub(crate) struct SharedSink(pub(crate) Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub(crate) fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// context.rs — per-parser callbacks and user-visible messages
//
// The engine never prints. Everything user-visible goes through the
// message callback with a level; progress goes through its own callback,
// throttled so a tight parse loop cannot flood the caller. One context
// per parser, one parser per thread; nothing here is shared.

use std::sync::OnceLock;
use std::time::Instant;

/// Floor between two progress callbacks.
pub const MIN_PROGRESS_TIME_MS: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

pub type MessageCallback = Box<dyn FnMut(MessageLevel, &str) + Send>;
pub type ProgressCallback = Box<dyn FnMut(f32) + Send>;

/// Invoked right before the library would otherwise abort on an
/// unrecoverable internal fault. Injected at context creation instead of
/// being process-global so embedders can route it.
pub type CrashCallback = fn(&str);

/// Monotonic time in milliseconds relative to a process-wide epoch.
pub fn milliseconds() -> i32 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as i32
}

pub struct Context {
    message_callback: Option<MessageCallback>,
    progress_callback: Option<ProgressCallback>,
    crash_callback: Option<CrashCallback>,
    last_progress_ms: i32,
}

impl Context {
    pub fn new() -> Self {
        Self {
            message_callback: None,
            progress_callback: None,
            crash_callback: None,
            last_progress_ms: i32::MIN / 2,
        }
    }

    pub fn set_callbacks(
        &mut self,
        message: Option<MessageCallback>,
        progress: Option<ProgressCallback>,
    ) {
        self.message_callback = message;
        self.progress_callback = progress;
    }

    pub fn set_crash_callback(&mut self, callback: CrashCallback) {
        self.crash_callback = Some(callback);
    }

    /// Forget throttle state between files.
    pub fn reset(&mut self) {
        self.last_progress_ms = i32::MIN / 2;
    }

    fn log(&mut self, level: MessageLevel, message: &str) {
        if let Some(cb) = self.message_callback.as_mut() {
            cb(level, message);
        }
    }

    pub fn log_info(&mut self, message: &str) {
        self.log(MessageLevel::Info, message);
    }

    pub fn log_warning(&mut self, message: &str) {
        self.log(MessageLevel::Warning, message);
    }

    pub fn log_error(&mut self, message: &str) {
        self.log(MessageLevel::Error, message);
    }

    /// Report progress in [0, 1]. Calls closer together than
    /// MIN_PROGRESS_TIME_MS are dropped, except the terminal 1.0.
    pub fn notify_progress(&mut self, progress: f32) {
        let now = milliseconds();
        if progress < 1.0 && now - self.last_progress_ms < MIN_PROGRESS_TIME_MS {
            return;
        }
        self.last_progress_ms = now;
        if let Some(cb) = self.progress_callback.as_mut() {
            cb(progress.clamp(0.0, 1.0));
        }
    }

    /// Route an unrecoverable fault to the embedder, falling back to the
    /// message sink.
    pub fn crash(&mut self, message: &str) {
        if let Some(cb) = self.crash_callback {
            cb(message);
        } else {
            self.log(MessageLevel::Error, message);
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Tests
// ============================================================

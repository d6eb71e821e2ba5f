//! Degeneration watchdog for streamed answer fragments.
//!
//! Models occasionally fall into loops (the same fragment over and over, or
//! a short phrase cycling). The guard sees every fragment before it reaches
//! the caller and trips once a loop or the hard fragment cap is detected;
//! the generator then ends the stream with a `degenerate` truncation.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StreamGuardConfig {
    /// Same fragment N times in a row trips the guard.
    pub max_identical_run: usize,
    /// Length of the fragment window compared against the window before it.
    pub window: usize,
    /// Back-to-back identical windows tolerated before tripping.
    pub max_window_repeats: usize,
    /// Hard cap on fragments per answer.
    pub max_total_fragments: usize,
}

impl Default for StreamGuardConfig {
    fn default() -> Self {
        Self {
            max_identical_run: 20,
            window: 10,
            max_window_repeats: 5,
            max_total_fragments: 8192,
        }
    }
}

/// Why the guard tripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degeneration {
    IdenticalRun { count: usize },
    WindowRepeat { window: usize, repeats: usize },
    FragmentCap { total: usize },
}

impl fmt::Display for Degeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdenticalRun { count } => write!(f, "identical fragment repeated {count} times"),
            Self::WindowRepeat { window, repeats } => {
                write!(f, "{window}-fragment sequence repeated {repeats} times")
            }
            Self::FragmentCap { total } => write!(f, "fragment cap reached at {total}"),
        }
    }
}

/// One guard per answer stream.
pub struct StreamGuard {
    config: StreamGuardConfig,
    recent: VecDeque<String>,
    total: usize,
    run: usize,
    window_repeats: usize,
}

impl StreamGuard {
    pub fn new(config: StreamGuardConfig) -> Self {
        let cap = config.window.saturating_mul(2).max(1);
        Self {
            config,
            recent: VecDeque::with_capacity(cap),
            total: 0,
            run: 0,
            window_repeats: 0,
        }
    }

    /// Inspect the next fragment. `Err` means the stream must stop; the
    /// fragment that tripped the guard is not to be forwarded.
    pub fn check(&mut self, fragment: &str) -> Result<(), Degeneration> {
        self.total += 1;
        if self.total > self.config.max_total_fragments {
            return Err(Degeneration::FragmentCap {
                total: self.config.max_total_fragments,
            });
        }

        // Whitespace-only fragments (newlines between list items) are
        // ignored by the loop detectors.
        if fragment.trim().is_empty() {
            return Ok(());
        }

        let same_as_last = self.recent.back().is_some_and(|last| last == fragment);
        if same_as_last {
            self.run += 1;
        } else {
            self.run = 1;
        }
        if self.config.max_identical_run > 0 && self.run >= self.config.max_identical_run {
            return Err(Degeneration::IdenticalRun { count: self.run });
        }

        let k = self.config.window;
        if k == 0 {
            return Ok(());
        }
        if self.recent.len() == 2 * k {
            self.recent.pop_front();
        }
        self.recent.push_back(fragment.to_string());

        if self.recent.len() == 2 * k {
            let (older, newer) = (self.recent.range(..k), self.recent.range(k..));
            if older.eq(newer) {
                self.window_repeats += 1;
                if self.window_repeats >= self.config.max_window_repeats {
                    return Err(Degeneration::WindowRepeat {
                        window: k,
                        repeats: self.window_repeats,
                    });
                }
            } else {
                self.window_repeats = 0;
            }
        }

        Ok(())
    }

    pub fn fragments_seen(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight() -> StreamGuard {
        StreamGuard::new(StreamGuardConfig {
            max_identical_run: 4,
            window: 3,
            max_window_repeats: 2,
            max_total_fragments: 50,
        })
    }

    #[test]
    fn varied_answer_passes() {
        let mut guard = StreamGuard::new(StreamGuardConfig::default());
        for f in ["Your", " glucose", " of", " 95", " mg/dL", " is", " in", " range", "."] {
            assert!(guard.check(f).is_ok());
        }
        assert_eq!(guard.fragments_seen(), 9);
    }

    #[test]
    fn identical_run_trips() {
        let mut guard = tight();
        for _ in 0..3 {
            assert!(guard.check(" the").is_ok());
        }
        assert_eq!(guard.check(" the"), Err(Degeneration::IdenticalRun { count: 4 }));
    }

    #[test]
    fn whitespace_runs_are_tolerated() {
        let mut guard = tight();
        for _ in 0..10 {
            assert!(guard.check("\n").is_ok());
        }
    }

    #[test]
    fn cycling_phrase_trips() {
        let mut guard = tight();
        let cycle = ["a", "b", "c"];
        let mut tripped = None;
        for i in 0..30 {
            if let Err(d) = guard.check(cycle[i % 3]) {
                tripped = Some(d);
                break;
            }
        }
        assert!(matches!(tripped, Some(Degeneration::WindowRepeat { window: 3, .. })));
    }

    #[test]
    fn fragment_cap_trips() {
        let mut guard = StreamGuard::new(StreamGuardConfig {
            max_total_fragments: 5,
            ..StreamGuardConfig::default()
        });
        for i in 0..5 {
            assert!(guard.check(&format!("w{i}")).is_ok());
        }
        assert_eq!(guard.check("w5"), Err(Degeneration::FragmentCap { total: 5 }));
    }
}

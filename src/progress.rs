//! Progress reporting for long running operations.

use core::fmt;

/// Operation being reported on
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Stage {
    Erase,
    Read,
    Write,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Erase => "Erasing",
            Stage::Read => "Reading",
            Stage::Write => "Writing",
            Stage::Verify => "Verifying",
        };
        f.write_str(s)
    }
}

/// Progress information provided to the progress handler
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Progress {
    pub stage: Stage,
    /// Units completed so far, bytes for transfers and sectors for erase
    pub complete: usize,
    pub total: usize,
}

/// Drive an `indicatif` progress bar from programmer progress updates
#[cfg(feature = "indicatif")]
pub fn progress_bar(bar: indicatif::ProgressBar) -> impl FnMut(Progress) + Send + 'static {
    move |p: Progress| {
        bar.set_message(p.stage.to_string());
        bar.set_length(p.total as u64);
        bar.set_position(p.complete as u64);
    }
}

#[cfg(all(test, feature = "indicatif"))]
mod tests {
    use super::*;

    #[test]
    fn bar_follows_updates() {
        let bar = indicatif::ProgressBar::hidden();
        let mut update = progress_bar(bar.clone());

        update(Progress {
            stage: Stage::Write,
            complete: 256,
            total: 600,
        });
        assert_eq!(bar.position(), 256);

        update(Progress {
            stage: Stage::Write,
            complete: 600,
            total: 600,
        });
        assert_eq!(bar.position(), 600);
    }
}

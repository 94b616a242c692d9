//! Plot and logger sinks, and the fan-out the experiment loop drives.
//!
//! Sinks are called synchronously on the tick task, in registration order.
//! The first error aborts the tick.

use crate::error::{LabError, Result, Stage};
use crate::record::Row;
use crate::table::Snapshot;

/// Receives the full table after every tick and redraws from scratch.
pub trait PlotSink: Send {
    fn render(&mut self, data: &Snapshot) -> anyhow::Result<()>;
}

impl<F> PlotSink for F
where
    F: FnMut(&Snapshot) -> anyhow::Result<()> + Send,
{
    fn render(&mut self, data: &Snapshot) -> anyhow::Result<()> {
        self(data)
    }
}

/// Row-by-row recorder with a start/log/finish lifecycle.
///
/// `start` gets the first sample of a run (acquire resources there),
/// `log` every sample including the first, `finish` is called once when the
/// run ends for any reason.
pub trait Logger: Send {
    fn start(&mut self, _first: &Row) -> anyhow::Result<()> {
        Ok(())
    }

    fn log(&mut self, _row: &Row) -> anyhow::Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Logger for Box<dyn Logger> {
    fn start(&mut self, first: &Row) -> anyhow::Result<()> {
        (**self).start(first)
    }

    fn log(&mut self, row: &Row) -> anyhow::Result<()> {
        (**self).log(row)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        (**self).finish()
    }
}

#[derive(Default)]
pub struct Sinks {
    plots: Vec<Box<dyn PlotSink>>,
    loggers: Vec<Box<dyn Logger>>,
}

impl Sinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plot(&mut self, plot: impl PlotSink + 'static) {
        self.plots.push(Box::new(plot));
    }

    pub fn add_logger(&mut self, logger: impl Logger + 'static) {
        self.loggers.push(Box::new(logger));
    }

    pub fn has_plots(&self) -> bool {
        !self.plots.is_empty()
    }

    pub fn loggers(&self) -> usize {
        self.loggers.len()
    }

    pub fn start(&mut self, first: &Row) -> Result<()> {
        for logger in &mut self.loggers {
            logger
                .start(first)
                .map_err(|e| LabError::failure(Stage::Logger, e))?;
        }
        Ok(())
    }

    pub fn log(&mut self, row: &Row) -> Result<()> {
        for logger in &mut self.loggers {
            logger
                .log(row)
                .map_err(|e| LabError::failure(Stage::Logger, e))?;
        }
        Ok(())
    }

    /// Finish every logger, even when an earlier one fails; the first error
    /// is returned.
    pub fn finish(&mut self) -> Result<()> {
        let mut first_err = None;
        for logger in &mut self.loggers {
            if let Err(e) = logger.finish() {
                first_err.get_or_insert(LabError::failure(Stage::Logger, e));
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn render(&mut self, data: &Snapshot) -> Result<()> {
        for plot in &mut self.plots {
            plot.render(data)
                .map_err(|e| LabError::failure(Stage::Plot, e))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks")
            .field("plots", &self.plots.len())
            .field("loggers", &self.loggers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Failing;

    impl Logger for Failing {
        fn finish(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    struct Counting(Arc<Mutex<usize>>);

    impl Logger for Counting {
        fn finish(&mut self) -> anyhow::Result<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn finish_reaches_every_logger() {
        let finished = Arc::new(Mutex::new(0));
        let mut sinks = Sinks::new();
        sinks.add_logger(Failing);
        sinks.add_logger(Counting(Arc::clone(&finished)));

        let err = sinks.finish().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Logger));
        assert_eq!(*finished.lock().unwrap(), 1);
    }

    #[test]
    fn plot_errors_carry_stage() {
        let mut sinks = Sinks::new();
        sinks.add_plot(|_: &Snapshot| -> anyhow::Result<()> { anyhow::bail!("no display") });
        let err = sinks.render(&Snapshot::default()).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Plot));
        assert!(err.to_string().contains("no display"));
    }
}

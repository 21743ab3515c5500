use std::sync::Arc;

use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    item::EnvelopeReceiver,
    stage::{StageInput, StageSummary, StageTask},
};

/// The `width` parallel workers of one stage.
pub struct FanOut<T> {
    pub outputs: Vec<EnvelopeReceiver<T>>,
    pub handles: Vec<JoinHandle<StageSummary>>,
}

/// Replicate `task` across `width` workers that all pull from `input`.
///
/// Every envelope is delivered to exactly one worker. Order is kept per
/// worker only. All returned outputs must be drained together (normally
/// through [`crate::fanin::fan_in`]): reading only some of them lets the
/// others fill up, which stalls their workers and eventually everything
/// upstream.
pub fn fan_out<T: Send + 'static>(
    input: EnvelopeReceiver<T>,
    width: usize,
    task: StageTask<T>,
    capacity: usize,
) -> anyhow::Result<FanOut<T>> {
    if width == 0 {
        return Err(anyhow::anyhow!(
            "fan-out width for stage {} must be at least 1",
            task.name()
        ));
    }

    let shared = Arc::new(Mutex::new(input));
    let mut outputs = Vec::with_capacity(width);
    let mut handles = Vec::with_capacity(width);
    for worker in 0..width {
        let (rx, handle) = task
            .for_worker(worker)
            .spawn(StageInput::Shared(Arc::clone(&shared)), capacity);
        outputs.push(rx);
        handles.push(handle);
    }

    log::debug!("stage {}: fanned out to {} workers", task.name(), width);
    Ok(FanOut { outputs, handles })
}

#[cfg(test)]
#[path = "fanout_test.rs"]
mod fanout_test;

use std::sync::Arc;

use crate::run::RunCompletion;

/// Receives every terminal run exactly once.
///
/// Called from the completion path of the registry while completions are
/// serialized; implementations must not call back into the `RunRegistry`.
pub trait CompletionSink: Send + Sync {
    fn on_run_completed(&self, completion: &RunCompletion);
}

impl<F> CompletionSink for F
where
    F: Fn(&RunCompletion) + Send + Sync,
{
    fn on_run_completed(&self, completion: &RunCompletion) {
        self(completion)
    }
}

/// Fans one completion out to several sinks, in registration order.
#[derive(Default, Clone)]
pub struct CompletionRouter {
    sinks: Vec<Arc<dyn CompletionSink>>,
}

impl CompletionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl CompletionSink for CompletionRouter {
    fn on_run_completed(&self, completion: &RunCompletion) {
        for sink in &self.sinks {
            sink.on_run_completed(completion);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ThreadKey;
    use crate::run::RunOutcome;
    use std::sync::Mutex;

    #[test]
    fn router_calls_sinks_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let seen = seen.clone();
            move |_: &RunCompletion| seen.lock().unwrap().push("first")
        };
        let second = {
            let seen = seen.clone();
            move |_: &RunCompletion| seen.lock().unwrap().push("second")
        };
        let router = CompletionRouter::new()
            .with(Arc::new(first))
            .with(Arc::new(second));

        router.on_run_completed(&RunCompletion {
            key: ThreadKey::new("r1", "t1"),
            run_id: None,
            outcome: RunOutcome::Success,
            conversation: None,
        });
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }
}

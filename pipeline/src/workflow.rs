use crate::collaborators::{Execution, WorkflowStarter};
use crate::errors::{PipelineError, Result};
use crate::retry::{RetryPolicy, submit_with_retry_if};
use uuid::Uuid;

/// Starts one workflow execution for `input`, retrying with `policy`.
///
/// Each attempt uses a fresh execution name, so an attempt that failed after the execution was
/// created produces a second execution rather than a name conflict. Errors that cannot succeed on
/// a retry are returned after the first attempt.
pub async fn start_with_retry(
    starter: &dyn WorkflowStarter,
    policy: &RetryPolicy,
    input: &str,
) -> Result<Execution> {
    submit_with_retry_if(policy, "workflow.start", PipelineError::is_retryable, move || {
        let execution_name = Uuid::new_v4().to_string();
        async move { starter.start(&execution_name, input).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::time::Duration;

    struct FlakyStarter {
        failures: Mutex<u32>,
        names: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkflowStarter for FlakyStarter {
        async fn start(&self, execution_name: &str, _input: &str) -> Result<Execution> {
            self.names.lock().unwrap().push(execution_name.to_string());
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PipelineError::TransientSink("throttled".into()));
            }
            Ok(Execution {
                execution_id: format!("exec:{execution_name}"),
                start_time: Utc::now(),
            })
        }
    }

    struct UnconfiguredStarter {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl WorkflowStarter for UnconfiguredStarter {
        async fn start(&self, _execution_name: &str, _input: &str) -> Result<Execution> {
            *self.calls.lock().unwrap() += 1;
            Err(PipelineError::Configuration("state machine".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_name_per_attempt() {
        let starter = FlakyStarter {
            failures: Mutex::new(2),
            names: Mutex::new(Vec::new()),
        };
        let policy = RetryPolicy::new(2, Duration::from_millis(200));

        let execution = start_with_retry(&starter, &policy, r#"{"messageId":"m1"}"#)
            .await
            .unwrap();

        let names = starter.names.lock().unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names.iter().collect::<HashSet<_>>().len(), 3);
        assert_eq!(execution.execution_id, format!("exec:{}", names[2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retries() {
        let starter = FlakyStarter {
            failures: Mutex::new(5),
            names: Mutex::new(Vec::new()),
        };
        let policy = RetryPolicy::new(1, Duration::from_millis(200));

        let result = start_with_retry(&starter, &policy, "{}").await;
        assert!(matches!(result, Err(PipelineError::TransientSink(_))));
        assert_eq!(starter.names.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_is_not_retried() {
        let starter = UnconfiguredStarter {
            calls: Mutex::new(0),
        };
        let policy = RetryPolicy::new(3, Duration::from_millis(200));

        let result = start_with_retry(&starter, &policy, "{}").await;
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
        assert_eq!(*starter.calls.lock().unwrap(), 1);
    }
}

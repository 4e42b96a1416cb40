//! Asynchronous job completion
//!
//! The broker reports job progress only through the job object's `JobState`,
//! so the waiter re-resolves the job by path between polls; a handle never
//! observes changes made after it was fetched.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::wmi::{Instance, Service};
use crate::{Error, Result};

/// Lowest `JobState` that is terminal (completed, possibly with errors)
pub const JOB_STATE_COMPLETED: u16 = 7;

/// `ReturnValue` of a method that started an asynchronous job
pub const RETURN_JOB_STARTED: u32 = 4096;

/// Polls a job to completion
pub struct JobWaiter<'s> {
    service: &'s Service,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl<'s> JobWaiter<'s> {
    pub fn new(service: &'s Service) -> Self {
        let config = service.config();
        Self {
            service,
            poll_interval: config.poll_interval(),
            timeout: config.job_timeout(),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Give up with [`Error::Timeout`] once `limit` has passed
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Wait for `job` to reach a terminal state and return the final handle.
    ///
    /// A non-zero `ErrorCode` becomes [`Error::Job`] carrying the code and the
    /// description with newlines collapsed.
    pub fn wait(&self, job: Instance) -> Result<Instance> {
        let started = Instant::now();
        let mut current = job;
        let mut polls = 0u32;

        loop {
            let state: u16 = current.get_as("JobState")?;
            polls += 1;
            if state >= JOB_STATE_COMPLETED {
                break;
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    warn!(state, polls, "job wait timed out");
                    return Err(Error::Timeout(limit));
                }
            }
            debug!(state, polls, "job still running");
            std::thread::sleep(self.poll_interval);
            // the previous handle is released on reassignment
            current = self.service.refetch(&current)?;
        }

        let code: u32 = current.get_as("ErrorCode")?;
        if code != 0 {
            let description = clean_description(&current.get_as_string("ErrorDescription")?);
            warn!(code, description = %description, "job failed");
            return Err(Error::Job { code, description });
        }

        info!(polls, elapsed_ms = started.elapsed().as_millis() as u64, "job completed");
        Ok(current)
    }

    /// Interpret a method's `ReturnValue`: wait on `job` if one was started,
    /// succeed on zero, fail otherwise
    pub fn wait_result(&self, method: &str, return_value: u32, job: Option<Instance>) -> Result<()> {
        match return_value {
            0 => Ok(()),
            RETURN_JOB_STARTED => {
                let job = job.ok_or_else(|| {
                    Error::NotFound(format!("{} started a job but returned no job reference", method))
                })?;
                self.wait(job).map(drop)
            }
            code => Err(Error::MethodFailed {
                method: method.to_string(),
                code,
            }),
        }
    }
}

fn clean_description(description: &str) -> String {
    description.replace(['\r', '\n'], " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::wmi::memory::MemoryBroker;

    fn setup(states: &[u16], code: u16, description: &str) -> (MemoryBroker, Service, String) {
        let broker = MemoryBroker::new();
        let path = broker.insert_job(states, code, description).unwrap();
        let config = SessionConfig::builder().poll_interval_ms(0).build();
        let service = Service::connect(&broker, &config).unwrap();
        (broker, service, path)
    }

    #[test]
    fn test_polls_until_terminal() {
        let (broker, service, path) = setup(&[2, 2, 7], 0, "");
        let job = service.get_object(&path).unwrap();
        broker.clear_calls();

        let done = service.wait_job(job).unwrap();
        assert_eq!(broker.reads_of("JobState"), 3);
        assert_eq!(done.get_as::<u16>("JobState").unwrap(), 7);
    }

    #[test]
    fn test_failure_carries_code_and_clean_description() {
        let (_broker, service, path) = setup(&[4, 7], 32773, "bad\nkey\n");
        let job = service.get_object(&path).unwrap();

        let err = service.wait_job(job).unwrap_err();
        assert_eq!(err.job_code(), Some(32773));
        assert!(err.to_string().contains("bad key"));
        assert!(matches!(err, Error::Job { ref description, .. } if description == "bad key"));
    }

    #[test]
    fn test_timeout() {
        let (_broker, service, path) = setup(&[4, 4, 4, 4], 0, "");
        let job = service.get_object(&path).unwrap();

        let err = service
            .job_waiter()
            .timeout(Duration::ZERO)
            .wait(job)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_return_value_handling() {
        let (_broker, service, path) = setup(&[7], 0, "");
        let waiter = service.job_waiter();

        assert!(waiter.wait_result("DefineSystem", 0, None).is_ok());
        let job = service.get_object(&path).unwrap();
        assert!(waiter.wait_result("DefineSystem", RETURN_JOB_STARTED, Some(job)).is_ok());
        assert!(waiter.wait_result("DefineSystem", RETURN_JOB_STARTED, None).is_err());
        assert!(matches!(
            waiter.wait_result("DefineSystem", 32775, None),
            Err(Error::MethodFailed { code: 32775, .. })
        ));
    }

    #[test]
    fn test_clean_description() {
        assert_eq!(clean_description("  a\r\nb\n"), "a  b");
        assert_eq!(clean_description(""), "");
    }
}

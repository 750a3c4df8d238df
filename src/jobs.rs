//! Queue payloads exchanged with the worker's clients

use serde::{Deserialize, Serialize};

use crate::result::ExecutionResult;

/// Job received from the Redis queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub job_id: String,
    pub code: String,
    pub language: String,
}

/// Final outcome stored and published for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub result: ExecutionResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{Failure, Phase};

    #[test]
    fn test_job_parsing() {
        let job: ExecuteJob = serde_json::from_str(
            r#"{"job_id":"abc","code":"print(1)","language":"js"}"#,
        )
        .unwrap();

        assert_eq!(job.job_id, "abc");
        assert_eq!(job.language, "js");
    }

    #[test]
    fn test_job_result_shape() {
        let result = JobResult {
            job_id: "abc".to_string(),
            result: Failure::new(Phase::Compile, "expected ';'", 12).into(),
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["job_id"], "abc");
        assert_eq!(value["result"]["status"], "failure");
        assert_eq!(value["result"]["phase"], "compile");
        assert_eq!(value["result"]["error_message"], "expected ';'");
    }
}

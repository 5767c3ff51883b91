//! Table and JSON output formatting for CLI commands.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tabled::{Table, Tabled};

use batchq_entity::job::Job;

/// Output format selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// JSON output
    Json,
}

/// One line of `jobs list`
#[derive(Debug, Serialize, Tabled)]
pub struct JobRow {
    #[tabled(rename = "ID")]
    pub id: i64,
    #[tabled(rename = "Batch Spec")]
    pub batch_spec_id: i64,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Worker")]
    pub worker: String,
    #[tabled(rename = "Failures")]
    pub num_failures: i32,
    #[tabled(rename = "Resets")]
    pub num_resets: i32,
    #[tabled(rename = "Process After")]
    pub process_after: String,
    #[tabled(rename = "Updated")]
    pub updated_at: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.get(),
            batch_spec_id: job.batch_spec_id.get(),
            state: job.state.to_string(),
            worker: job.worker_hostname.clone(),
            num_failures: job.num_failures,
            num_resets: job.num_resets,
            process_after: job.process_after.map(timestamp).unwrap_or_default(),
            updated_at: timestamp(job.updated_at),
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Print a list of items in the selected format
pub fn print_list<T: Serialize + Tabled>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No results found.");
            } else {
                let table = Table::new(items).to_string();
                println!("{}", table);
            }
        }
        OutputFormat::Json => print_json(items),
    }
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => print_error(&format!("Failed to serialize output: {}", e)),
    }
}

/// Print one job with its execution log
pub fn print_job(job: &Job, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(job);
        return;
    }

    println!("Job {}:", job.id);
    print_kv("Batch Spec", &job.batch_spec_id.to_string());
    print_kv("State", job.state.as_str());
    print_kv("Allow Unsupported", &job.allow_unsupported.to_string());
    print_kv("Allow Ignored", &job.allow_ignored.to_string());
    print_kv("Worker", &job.worker_hostname);
    print_kv("Failures", &job.num_failures.to_string());
    print_kv("Resets", &job.num_resets.to_string());
    print_kv("Failure Message", job.failure_message.as_deref().unwrap_or("-"));
    print_kv("Created", &timestamp(job.created_at));
    print_kv("Updated", &timestamp(job.updated_at));
    print_kv("Started", &job.started_at.map(timestamp).unwrap_or_default());
    print_kv("Finished", &job.finished_at.map(timestamp).unwrap_or_default());
    print_kv(
        "Process After",
        &job.process_after.map(timestamp).unwrap_or_default(),
    );

    if job.execution_logs.is_empty() {
        return;
    }
    println!();
    println!("Execution log:");
    for entry in &job.execution_logs {
        println!(
            "  #{} {:?} on {} at {} ({} ms){}",
            entry.attempt,
            entry.outcome,
            entry.worker_hostname,
            timestamp(entry.started_at),
            entry.duration_ms(),
            entry
                .detail
                .as_deref()
                .map(|d| format!(": {d}"))
                .unwrap_or_default()
        );
    }
}

/// Print a success message
pub fn print_success(msg: &str) {
    println!("✓ {}", msg);
}

/// Print an error message
pub fn print_error(msg: &str) {
    eprintln!("✗ {}", msg);
}

/// Print a key-value pair
pub fn print_kv(key: &str, value: &str) {
    println!("  {:<24} {}", format!("{}:", key), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchq_core::types::{BatchSpecId, JobId};
    use batchq_entity::job::JobState;
    use chrono::TimeZone;

    #[test]
    fn test_job_row_formats_timestamps() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let job = Job {
            id: JobId(5),
            batch_spec_id: BatchSpecId(77),
            allow_unsupported: false,
            allow_ignored: false,
            state: JobState::Queued,
            failure_message: None,
            started_at: None,
            finished_at: None,
            process_after: Some(at),
            num_resets: 0,
            num_failures: 1,
            execution_logs: Vec::new(),
            worker_hostname: String::new(),
            created_at: at,
            updated_at: at,
        };

        let row = JobRow::from(&job);
        assert_eq!(row.id, 5);
        assert_eq!(row.state, "queued");
        assert_eq!(row.process_after, "2024-03-01 12:30:00");
    }
}

use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use super::Job;
use crate::config::SchedulerConfig;

/// Parsed cron schedules for the engine's periodic jobs.
#[derive(Debug, Clone)]
pub struct Scheduler {
    entries: Vec<(Job, CronSchedule)>,
}

fn parse(expr: &str, job: Job) -> Result<CronSchedule> {
    CronSchedule::from_str(expr)
        .map_err(|e| anyhow::anyhow!("invalid cron expression '{}' for {}: {}", expr, job.as_str(), e))
}

impl Scheduler {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        Ok(Self {
            entries: vec![
                (Job::Learning, parse(&config.learning_cron, Job::Learning)?),
                (Job::Retrain, parse(&config.retrain_cron, Job::Retrain)?),
                (Job::Sweep, parse(&config.sweep_cron, Job::Sweep)?),
            ],
        })
    }

    pub fn jobs(&self) -> impl Iterator<Item = Job> + '_ {
        self.entries.iter().map(|(job, _)| *job)
    }

    /// Next fire time strictly after `after`.
    pub fn next_fire(&self, job: Job, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|(j, _)| *j == job)
            .and_then(|(_, schedule)| schedule.after(&after).next())
    }

    /// Every fire time in the next `hours`, sorted.
    pub fn preview(&self, from: DateTime<Utc>, hours: i64) -> Vec<(DateTime<Utc>, Job)> {
        let end = from + Duration::hours(hours);
        let mut preview: Vec<(DateTime<Utc>, Job)> = self
            .entries
            .iter()
            .flat_map(|(job, schedule)| {
                schedule
                    .after(&from)
                    .take_while(move |t| *t <= end)
                    .map(move |t| (t, *job))
            })
            .collect();
        preview.sort();
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedules_parse() {
        let s = Scheduler::from_config(&SchedulerConfig::default()).unwrap();
        assert_eq!(s.jobs().count(), 3);
    }

    #[test]
    fn test_rejects_bad_expression() {
        let config = SchedulerConfig {
            sweep_cron: "every now and then".into(),
            ..SchedulerConfig::default()
        };
        let err = Scheduler::from_config(&config).unwrap_err().to_string();
        assert!(err.contains("sweep"));
    }

    #[test]
    fn test_next_fire_and_preview() {
        let s = Scheduler::from_config(&SchedulerConfig::default()).unwrap();
        let from = DateTime::parse_from_rfc3339("2024-03-04T10:00:00Z").unwrap().with_timezone(&Utc);
        let next = s.next_fire(Job::Learning, from).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-03-04T10:05:00+00:00");

        let preview = s.preview(from, 1);
        // Four sweeps and one learning pass within the hour.
        assert_eq!(preview.iter().filter(|(_, j)| *j == Job::Sweep).count(), 4);
        assert_eq!(preview.iter().filter(|(_, j)| *j == Job::Learning).count(), 1);
        assert!(preview.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}

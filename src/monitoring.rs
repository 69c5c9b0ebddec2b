//! Training monitoring: per-stage timings and worker reply latencies.
//!
//! Every protocol emitter brackets its body with [`Monitoring::begin_stage`]
//! and [`Monitoring::end_stage`]. `FindSplits` additionally records the reply
//! latency of each worker, from which rolling min/median/max statistics are
//! derived for the training log line. The monitoring object is owned and
//! touched only by the driver thread.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use log::{debug, warn};

/// Interval between two full training log lines.
const DISPLAY_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Protocol stage, one per emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    StartTraining,
    GetLabelStatistics,
    SetInitialPredictions,
    StartNewIter,
    FindSplits,
    EvaluateSplits,
    ShareSplits,
    EndIter,
    CreateCheckpoint,
    RestoreCheckpoint,
}

const NUM_STAGES: usize = 10;

const ALL_STAGES: [Stage; NUM_STAGES] = [
    Stage::StartTraining,
    Stage::GetLabelStatistics,
    Stage::SetInitialPredictions,
    Stage::StartNewIter,
    Stage::FindSplits,
    Stage::EvaluateSplits,
    Stage::ShareSplits,
    Stage::EndIter,
    Stage::CreateCheckpoint,
    Stage::RestoreCheckpoint,
];

impl Stage {
    fn index(self) -> usize {
        match self {
            Self::StartTraining => 0,
            Self::GetLabelStatistics => 1,
            Self::SetInitialPredictions => 2,
            Self::StartNewIter => 3,
            Self::FindSplits => 4,
            Self::EvaluateSplits => 5,
            Self::ShareSplits => 6,
            Self::EndIter => 7,
            Self::CreateCheckpoint => 8,
            Self::RestoreCheckpoint => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::StartTraining => "StartTraining",
            Self::GetLabelStatistics => "GetLabelStatistics",
            Self::SetInitialPredictions => "SetInitialPredictions",
            Self::StartNewIter => "StartNewIter",
            Self::FindSplits => "FindSplits",
            Self::EvaluateSplits => "EvaluateSplits",
            Self::ShareSplits => "ShareSplits",
            Self::EndIter => "EndIter",
            Self::CreateCheckpoint => "CreateCheckpoint",
            Self::RestoreCheckpoint => "RestoreCheckpoint",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StageStat {
    count: u64,
    total: Duration,
}

/// Rolling statistics of the training run.
#[derive(Debug)]
pub struct Monitoring {
    current_stage: Option<(Stage, Instant)>,
    stage_stats: [StageStat; NUM_STAGES],

    num_iters: u64,
    time_first_iter: Option<Instant>,

    // FindSplits reply latencies of the current stage, (worker, delay).
    reply_times: Vec<(usize, Duration)>,
    last_min_reply: Duration,
    last_median_reply: Duration,
    last_max_reply: Duration,
    last_fastest_worker: usize,
    last_slowest_worker: usize,
    sum_min_reply: Duration,
    sum_median_reply: Duration,
    sum_max_reply: Duration,
    count_reply_rounds: u64,

    last_display: Option<Instant>,
}

impl Default for Monitoring {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitoring {
    pub fn new() -> Self {
        Self {
            current_stage: None,
            stage_stats: [StageStat::default(); NUM_STAGES],
            num_iters: 0,
            time_first_iter: None,
            reply_times: Vec::new(),
            last_min_reply: Duration::ZERO,
            last_median_reply: Duration::ZERO,
            last_max_reply: Duration::ZERO,
            last_fastest_worker: 0,
            last_slowest_worker: 0,
            sum_min_reply: Duration::ZERO,
            sum_median_reply: Duration::ZERO,
            sum_max_reply: Duration::ZERO,
            count_reply_rounds: 0,
            last_display: None,
        }
    }

    pub fn begin_stage(&mut self, stage: Stage) {
        if let Some((previous, _)) = self.current_stage {
            warn!(
                "starting stage {} before stage {} completed",
                stage.name(),
                previous.name()
            );
            return;
        }
        self.current_stage = Some((stage, Instant::now()));
        debug!("starting stage {}", stage.name());
    }

    pub fn end_stage(&mut self, stage: Stage) {
        let Some((_, begin)) = self.current_stage.take() else {
            warn!("end_stage({}) without begin_stage", stage.name());
            return;
        };
        let elapsed = begin.elapsed();
        let stat = &mut self.stage_stats[stage.index()];
        stat.count += 1;
        stat.total += elapsed;

        if stage == Stage::FindSplits && !self.reply_times.is_empty() {
            self.reply_times.sort_by_key(|&(_, delay)| delay);
            let median = self.reply_times[self.reply_times.len() / 2].1;
            let (fastest_worker, min) = self.reply_times[0];
            let (slowest_worker, max) = *self.reply_times.last().unwrap();

            self.last_min_reply = min;
            self.last_median_reply = median;
            self.last_max_reply = max;
            self.last_fastest_worker = fastest_worker;
            self.last_slowest_worker = slowest_worker;
            self.sum_min_reply += min;
            self.sum_median_reply += median;
            self.sum_max_reply += max;
            self.count_reply_rounds += 1;
            self.reply_times.clear();
        }

        debug!("finishing stage {} in {elapsed:.2?}", stage.name());
    }

    /// Record the start of a boosting iteration.
    pub fn new_iter(&mut self) {
        if self.num_iters == 0 {
            self.time_first_iter = Some(Instant::now());
        }
        self.num_iters += 1;
    }

    /// Record one worker's reply latency during `FindSplits`.
    pub fn find_split_reply_time(&mut self, worker: usize, delay: Duration) {
        debug!("worker #{worker} replied to FindSplits in {delay:.2?}");
        self.reply_times.push((worker, delay));
    }

    /// Rate limiter for full training log lines: the first call fires, after
    /// which at most one line per 30 seconds.
    pub fn should_display_logs(&mut self) -> bool {
        let now = Instant::now();
        match self.last_display {
            None => {
                self.last_display = Some(now);
                true
            }
            Some(last) if now.duration_since(last) >= DISPLAY_LOG_INTERVAL => {
                self.last_display = Some(now);
                true
            }
            Some(_) => false,
        }
    }

    /// Compact statistics appended to the training log line.
    pub fn inline_logs(&self) -> String {
        let mut logs = String::new();
        if self.num_iters > 0 {
            if let Some(first) = self.time_first_iter {
                let per_iter = first.elapsed() / self.num_iters as u32;
                let _ = write!(logs, "time-per-iter:{per_iter:.2?}");
            }
        }
        let _ = write!(
            logs,
            " last-{{min,median,max}}-split-time:{:.2?} {:.2?} {:.2?}",
            self.last_min_reply, self.last_median_reply, self.last_max_reply
        );
        let _ = write!(
            logs,
            " last-{{slowest,fastest}}-worker:{} {}",
            self.last_slowest_worker, self.last_fastest_worker
        );
        if self.count_reply_rounds > 0 {
            let rounds = self.count_reply_rounds as u32;
            let _ = write!(
                logs,
                " mean-{{min,median,max}}-split-time:{:.2?} {:.2?} {:.2?}",
                self.sum_min_reply / rounds,
                self.sum_median_reply / rounds,
                self.sum_max_reply / rounds
            );
        }
        for stage in ALL_STAGES {
            let stat = self.stage_stats[stage.index()];
            if stat.count > 0 {
                let _ = write!(
                    logs,
                    "\n\t\t{}: avg:{:.2?} count:{}",
                    stage.name(),
                    stat.total / stat.count as u32,
                    stat.count
                );
            }
        }
        logs
    }
}

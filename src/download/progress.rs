//! 把任务事件画成 CLI 进度条：一条总进度（章节数）+ 每个运行中任务一条页面进度。

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::models::{JobEvent, JobId, JobReport, JobState, PageState};

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

pub struct ProgressReporter {
    mp: MultiProgress,
    style: ProgressStyle,
    overall: ProgressBar,
    bars: HashMap<JobId, ProgressBar>,
    labels: HashMap<JobId, String>,
}

impl ProgressReporter {
    pub fn new(total_jobs: usize) -> Self {
        Self::with_target(total_jobs, ProgressDrawTarget::stderr())
    }

    pub fn hidden(total_jobs: usize) -> Self {
        Self::with_target(total_jobs, ProgressDrawTarget::hidden())
    }

    fn with_target(total_jobs: usize, target: ProgressDrawTarget) -> Self {
        let mp = MultiProgress::with_draw_target(target);
        let style = bar_style();
        let overall = mp.add(ProgressBar::new(total_jobs as u64));
        overall.set_style(style.clone());
        overall.set_prefix("章节");
        Self {
            mp,
            style,
            overall,
            bars: HashMap::new(),
            labels: HashMap::new(),
        }
    }

    /// 登记任务的显示名（提交任务后调用）。
    pub fn label(&mut self, job_id: JobId, label: impl Into<String>) {
        self.labels.insert(job_id, label.into());
    }

    fn bar(&mut self, job_id: JobId) -> &ProgressBar {
        let (mp, style, labels) = (&self.mp, &self.style, &self.labels);
        self.bars.entry(job_id).or_insert_with(|| {
            let bar = mp.add(ProgressBar::new(0));
            bar.set_style(style.clone());
            bar.set_prefix(
                labels
                    .get(&job_id)
                    .cloned()
                    .unwrap_or_else(|| format!("任务 {job_id}")),
            );
            bar
        })
    }

    /// 处理一条事件；任务结束时返回它的报告。
    pub fn handle(&mut self, event: &JobEvent) -> Option<JobReport> {
        match event {
            JobEvent::State { job_id, state } => {
                if !state.is_terminal() {
                    self.bar(*job_id).set_message(state.to_string());
                }
                None
            }
            JobEvent::Resolved { job_id, pages, .. } => {
                let bar = self.bar(*job_id);
                bar.set_length(*pages as u64);
                bar.set_position(0);
                None
            }
            JobEvent::Page {
                job_id,
                state,
                attempt,
                ..
            } => {
                match state {
                    PageState::Succeeded | PageState::Failed => self.bar(*job_id).inc(1),
                    PageState::Retrying => {
                        self.bar(*job_id).set_message(format!("重试中（第 {attempt} 次）"))
                    }
                    // 过滤发生在页面成功之后，长度跟着减一
                    PageState::Filtered => {
                        let bar = self.bar(*job_id);
                        bar.set_length(bar.length().unwrap_or(0).saturating_sub(1));
                        bar.set_position(bar.position().saturating_sub(1));
                    }
                    PageState::Pending | PageState::InFlight => {}
                }
                None
            }
            JobEvent::Cooldown { job_id, wait } => {
                self.bar(*job_id)
                    .set_message(format!("限流冷却 {:.1}s", wait.as_secs_f32()));
                None
            }
            JobEvent::Finished(report) => {
                if let Some(bar) = self.bars.remove(&report.job_id) {
                    bar.finish_with_message(finish_message(report));
                    self.mp.remove(&bar);
                }
                self.labels.remove(&report.job_id);
                self.overall.inc(1);
                Some(report.clone())
            }
        }
    }

    pub fn finish(self) {
        for bar in self.bars.values() {
            bar.finish_and_clear();
        }
        self.overall.finish_and_clear();
    }
}

fn finish_message(report: &JobReport) -> String {
    match report.state {
        JobState::Completed => format!("{} {} 页", report.state, report.succeeded.len()),
        JobState::PartiallyFailed => format!(
            "{}（缺 {} 页）",
            report.state,
            report.missing.len()
        ),
        state => state.to_string(),
    }
}

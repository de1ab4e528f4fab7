//! 定时任务：`timerTasks` 与 `reportMode = periodic` 的周期上报。
//!
//! 每个任务一个循环，执行完一轮才等待下一个 tick；
//! 上一轮仍在执行时到期的 tick 被跳过，不补跑。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use domain::{EncodeMode, PointData, ReportMode, TimerTask, TimerTaskType};
use gw_pipeline::ReceivePipeline;
use gw_protocol::{Registry, TaskSet, parse_duration};
use gw_script::ScriptSandbox;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::ControlError;
use crate::sender::DeviceSender;

/// 任务间隔下限。
pub const MIN_TASK_INTERVAL: Duration = Duration::from_millis(10);

/// 一个配置周期内的全部定时任务。
pub struct Scheduler {
    tasks: TaskSet,
}

impl Scheduler {
    /// 解析全部驱动目录的任务并启动。任务声明非法时整体失败，不启动任何任务。
    pub fn start(
        sender: &DeviceSender,
        scripts: &HashMap<String, Arc<ScriptSandbox>>,
        pipeline: &Arc<ReceivePipeline>,
    ) -> Result<Self, ControlError> {
        let registry = sender.registry().clone();
        let mut jobs = Vec::new();
        for (key, config) in registry.configs() {
            for task in &config.tasks {
                jobs.push(timer_job(key, task, scripts)?);
            }
        }
        jobs.extend(periodic_jobs(&registry)?);

        let tasks = TaskSet::new();
        let count = jobs.len();
        for job in jobs {
            tasks.push(spawn_job(job, sender.clone(), pipeline.clone()));
        }
        info!(target: "gw.control", tasks = count, "scheduler started");
        Ok(Self { tasks })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn shutdown(&self) {
        self.tasks.abort_all();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}

enum JobKind {
    ReadPoints(Vec<(String, String)>),
    Script(Arc<ScriptSandbox>, String),
    Report(String, Vec<String>),
}

struct Job {
    name: String,
    every: Duration,
    kind: JobKind,
}

fn timer_job(
    key: &str,
    task: &TimerTask,
    scripts: &HashMap<String, Arc<ScriptSandbox>>,
) -> Result<Job, ControlError> {
    let every = task
        .interval_ms()
        .map(Duration::from_millis)
        .ok_or_else(|| ControlError::Config(format!("{key}: interval {}", task.interval)))?
        .max(MIN_TASK_INTERVAL);
    let kind = match task.task_type {
        TimerTaskType::ReadPoints => {
            let actions = task
                .read_points_actions()
                .map_err(|e| ControlError::Config(format!("{key}: read_points action: {e}")))?;
            let reads = actions
                .iter()
                .flat_map(|action| {
                    action.device_sns.iter().flat_map(move |sn| {
                        action.point_names.iter().map(move |p| (sn.clone(), p.clone()))
                    })
                })
                .collect();
            JobKind::ReadPoints(reads)
        }
        TimerTaskType::Script => {
            let function = task
                .script_function()
                .ok_or_else(|| ControlError::Config(format!("{key}: script task without function")))?;
            let script = scripts
                .get(key)
                .ok_or_else(|| ControlError::Config(format!("{key}: script task but no script loaded")))?;
            JobKind::Script(script.clone(), function.to_string())
        }
    };
    Ok(Job {
        name: format!("{key}/{:?}", task.task_type),
        every,
        kind,
    })
}

/// 每台设备按 `timerReport` 分组。
fn periodic_jobs(registry: &Registry) -> Result<Vec<Job>, ControlError> {
    let mut jobs = Vec::new();
    for device in registry.devices() {
        let Some(model) = registry.model(&device.model_name) else {
            continue;
        };
        let mut groups: BTreeMap<Duration, Vec<String>> = BTreeMap::new();
        for point in model.points.iter().filter(|p| p.report_mode == ReportMode::Periodic) {
            let Some(raw) = point.timer_report.as_deref() else {
                continue;
            };
            let every = parse_duration(raw, Duration::ZERO)
                .map_err(|e| ControlError::Config(format!("{}: timerReport: {e}", point.name)))?;
            if every.is_zero() {
                continue;
            }
            groups
                .entry(every.max(MIN_TASK_INTERVAL))
                .or_default()
                .push(point.name.clone());
        }
        for (every, points) in groups {
            jobs.push(Job {
                name: format!("{}/report", device.device_sn),
                every,
                kind: JobKind::Report(device.device_sn.clone(), points),
            });
        }
    }
    Ok(jobs)
}

fn spawn_job(
    job: Job,
    sender: DeviceSender,
    pipeline: Arc<ReceivePipeline>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(job.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // 首个 tick 立即返回，跳过它以便任务在一个周期后首次执行
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match &job.kind {
                JobKind::ReadPoints(reads) => {
                    for (sn, point) in reads {
                        // 失败已由 DeviceSender 记录
                        let _ = sender
                            .send(sn, EncodeMode::Read, &[PointData::new(point.clone(), Value::Null)])
                            .await;
                    }
                }
                JobKind::Script(script, function) => {
                    let script = script.clone();
                    let function = function.clone();
                    let outcome = tokio::task::spawn_blocking(move || script.call(&function, &[])).await;
                    match outcome {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            gw_telemetry::record_script_failure();
                            warn!(target: "gw.control", task = %job.name, error = %e, "script task failed");
                        }
                        Err(e) => warn!(target: "gw.control", task = %job.name, error = %e, "script task panicked"),
                    }
                }
                JobKind::Report(sn, points) => {
                    if let Err(e) = pipeline.republish(sn, points).await {
                        warn!(target: "gw.control", task = %job.name, error = %e, "periodic report failed");
                    }
                }
            }
            debug!(target: "gw.control", task = %job.name, "tick done");
        }
    })
}

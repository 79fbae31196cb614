// ==========================================
// 供应商目录导入系统 - 内存调控器
// ==========================================
// 职责: 定时采样进程常驻内存，自适应调整分块间节流延迟
// 技术: sysinfo 采样 + tokio interval 定时任务 + 原子量共享状态
// ==========================================

use crate::config::GovernorConfig;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ==========================================
// MemorySampler Trait
// ==========================================
pub trait MemorySampler: Send + Sync {
    /// 当前进程常驻内存（字节），不可用时返回 None
    fn resident_bytes(&self) -> Option<u64>;
}

/// 基于 sysinfo 的采样器
pub struct SysinfoSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "无法获取当前进程 ID，内存采样停用");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| p.memory())
    }
}

// ==========================================
// 调控状态
// ==========================================
#[derive(Debug, Default)]
struct GovernorState {
    delay_ms: AtomicU64,
    collect_hint: AtomicBool,
    failure_streak: AtomicU32,
    last_sample_bytes: AtomicU64,
}

impl GovernorState {
    fn step_up(&self, config: &GovernorConfig) -> u64 {
        let current = self.delay_ms.load(Ordering::Relaxed);
        let next = current
            .saturating_add(config.throttle_step_ms)
            .clamp(config.min_delay_ms, config.max_delay_ms);
        self.delay_ms.store(next, Ordering::Relaxed);
        next
    }

    fn step_down(&self, config: &GovernorConfig) -> u64 {
        let current = self.delay_ms.load(Ordering::Relaxed);
        let next = current
            .saturating_sub(config.throttle_step_ms)
            .clamp(config.min_delay_ms, config.max_delay_ms);
        self.delay_ms.store(next, Ordering::Relaxed);
        next
    }

    /// 按一次采样值调整
    fn apply_reading(&self, config: &GovernorConfig, resident: u64) {
        self.last_sample_bytes.store(resident, Ordering::Relaxed);
        let low_water = (config.high_water_bytes as f64 * config.low_water_ratio) as u64;

        if resident > config.high_water_bytes {
            let delay = self.step_up(config);
            self.collect_hint.store(true, Ordering::Relaxed);
            debug!(resident, high_water = config.high_water_bytes, delay_ms = delay, "内存高于高水位，加大节流");
        } else if resident < low_water {
            let before = self.delay_ms.load(Ordering::Relaxed);
            let delay = self.step_down(config);
            if delay != before {
                debug!(resident, delay_ms = delay, "内存回落，减小节流");
            }
        }
    }
}

// ==========================================
// MemoryGovernor
// ==========================================
pub struct MemoryGovernor {
    config: GovernorConfig,
    sampler: Arc<dyn MemorySampler>,
    state: Arc<GovernorState>,
    ticker: Option<JoinHandle<()>>,
}

impl MemoryGovernor {
    /// 创建调控器（未启动定时采样）
    ///
    /// # 参数
    /// - config: 高水位 / 步进 / 延迟上下限
    /// - sampler: 内存采样器
    pub fn new(config: GovernorConfig, sampler: Arc<dyn MemorySampler>) -> Self {
        let state = GovernorState::default();
        state.delay_ms.store(config.min_delay_ms, Ordering::Relaxed);
        Self {
            config,
            sampler,
            state: Arc::new(state),
            ticker: None,
        }
    }

    pub fn with_sysinfo(config: GovernorConfig) -> Self {
        Self::new(config, Arc::new(SysinfoSampler::new()))
    }

    /// 启动定时采样任务（重复调用无副作用）
    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let config = self.config.clone();
        let sampler = Arc::clone(&self.sampler);
        let state = Arc::clone(&self.state);
        let period = Duration::from_millis(config.sample_interval_ms.max(1));

        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Some(resident) = sampler.resident_bytes() {
                    state.apply_reading(&config, resident);
                }
            }
        }));
    }

    /// 停止定时采样
    pub fn stop(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }

    /// 立即采样一次
    pub fn sample_now(&self) {
        if let Some(resident) = self.sampler.resident_bytes() {
            self.state.apply_reading(&self.config, resident);
        }
    }

    /// 当前分块间节流延迟
    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.state.delay_ms.load(Ordering::Relaxed))
    }

    /// 取出回收提示（读后清零）
    pub fn take_collect_hint(&self) -> bool {
        self.state.collect_hint.swap(false, Ordering::Relaxed)
    }

    pub fn last_sample_bytes(&self) -> u64 {
        self.state.last_sample_bytes.load(Ordering::Relaxed)
    }

    /// 记录分块失败；连续失败达到阈值时强制加大节流
    pub fn record_failure(&self) {
        let streak = self.state.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= self.config.failure_threshold.max(1) {
            let delay = self.state.step_up(&self.config);
            warn!(streak, delay_ms = delay, "连续分块失败，加大节流");
        }
    }

    /// 记录分块成功（重置失败计数）
    pub fn record_success(&self) {
        self.state.failure_streak.store(0, Ordering::Relaxed);
    }

    pub fn failure_streak(&self) -> u32 {
        self.state.failure_streak.load(Ordering::Relaxed)
    }
}

impl Drop for MemoryGovernor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 可注入读数的采样器
    struct FixedSampler(AtomicU64);

    impl MemorySampler for FixedSampler {
        fn resident_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::Relaxed))
        }
    }

    fn config() -> GovernorConfig {
        GovernorConfig {
            high_water_bytes: 1_000,
            low_water_ratio: 0.7,
            sample_interval_ms: 10,
            throttle_step_ms: 50,
            min_delay_ms: 0,
            max_delay_ms: 120,
            failure_threshold: 2,
        }
    }

    #[test]
    fn test_throttle_rises_and_falls() {
        let sampler = Arc::new(FixedSampler(AtomicU64::new(2_000)));
        let governor = MemoryGovernor::new(config(), sampler.clone());

        governor.sample_now();
        assert_eq!(governor.throttle_delay(), Duration::from_millis(50));
        assert!(governor.take_collect_hint());
        assert!(!governor.take_collect_hint());

        governor.sample_now();
        governor.sample_now();
        assert_eq!(governor.throttle_delay(), Duration::from_millis(120));

        // 高低水位之间保持不变
        sampler.0.store(800, Ordering::Relaxed);
        governor.sample_now();
        assert_eq!(governor.throttle_delay(), Duration::from_millis(120));

        sampler.0.store(100, Ordering::Relaxed);
        governor.sample_now();
        governor.sample_now();
        governor.sample_now();
        assert_eq!(governor.throttle_delay(), Duration::ZERO);
        assert_eq!(governor.last_sample_bytes(), 100);
    }

    #[test]
    fn test_failure_streak_forces_throttle() {
        let sampler = Arc::new(FixedSampler(AtomicU64::new(0)));
        let governor = MemoryGovernor::new(config(), sampler);

        governor.record_failure();
        assert_eq!(governor.throttle_delay(), Duration::ZERO);
        governor.record_failure();
        assert_eq!(governor.throttle_delay(), Duration::from_millis(50));

        governor.record_success();
        assert_eq!(governor.failure_streak(), 0);
        governor.record_failure();
        assert_eq!(governor.throttle_delay(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_interval_sampling() {
        let sampler = Arc::new(FixedSampler(AtomicU64::new(5_000)));
        let mut governor = MemoryGovernor::new(config(), sampler);
        governor.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        governor.stop();
        assert!(governor.throttle_delay() > Duration::ZERO);
    }
}

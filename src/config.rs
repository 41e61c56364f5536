use std::time::Duration;

/// Tuning knobs for checkpoint creation and memory recovery.
///
/// Percent marks are expressed against `max_size` (the bucket quota); the
/// `*_bytes` helpers resolve them. One shared handle is passed to every
/// manager and to the remover at construction; there is no process-wide
/// default.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Bucket memory quota in bytes.
    pub max_size: usize,
    /// Open checkpoint is closed once it holds this many non-meta items.
    pub max_checkpoint_items: usize,
    /// Open checkpoint is closed once it has been open this long (and holds
    /// at least one item).
    pub max_checkpoint_time: Duration,
    /// Whether the remover may expel already-read items before resorting to
    /// cursor dropping.
    pub chk_expel_enabled: bool,
    /// Total-memory trigger for recovery, percent of quota.
    pub cursor_dropping_upper_mark: u8,
    /// Total-memory target once recovery triggers, percent of quota.
    pub cursor_dropping_lower_mark: u8,
    /// Checkpoint-memory trigger for recovery, percent of quota.
    pub cursor_dropping_checkpoint_mem_upper_mark: u8,
    /// Checkpoint-memory target once recovery triggers, percent of quota.
    pub cursor_dropping_checkpoint_mem_lower_mark: u8,
    /// Low watermark, percent of quota; the checkpoint-memory trigger only
    /// fires above it.
    pub mem_low_watermark: u8,
    /// Snooze between remover runs.
    pub remover_interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_size: 256 * 1024 * 1024,
            max_checkpoint_items: 10_000,
            max_checkpoint_time: Duration::from_secs(5),
            chk_expel_enabled: true,
            cursor_dropping_upper_mark: 95,
            cursor_dropping_lower_mark: 80,
            cursor_dropping_checkpoint_mem_upper_mark: 50,
            cursor_dropping_checkpoint_mem_lower_mark: 30,
            mem_low_watermark: 75,
            remover_interval: Duration::from_secs(1),
        }
    }
}

impl CheckpointConfig {
    pub fn production() -> Self {
        Self::default()
    }

    /// Large checkpoints, no expel: trades memory headroom for fewer
    /// checkpoint rolls under sustained load.
    pub fn benchmark() -> Self {
        Self {
            max_checkpoint_items: 50_000,
            max_checkpoint_time: Duration::from_secs(30),
            chk_expel_enabled: false,
            ..Self::default()
        }
    }

    fn percent_of_quota(&self, percent: u8) -> usize {
        (self.max_size / 100).saturating_mul(percent as usize)
    }

    pub fn cursor_dropping_upper_bytes(&self) -> usize {
        self.percent_of_quota(self.cursor_dropping_upper_mark)
    }

    pub fn cursor_dropping_lower_bytes(&self) -> usize {
        self.percent_of_quota(self.cursor_dropping_lower_mark)
    }

    pub fn checkpoint_mem_upper_bytes(&self) -> usize {
        self.percent_of_quota(self.cursor_dropping_checkpoint_mem_upper_mark)
    }

    pub fn checkpoint_mem_lower_bytes(&self) -> usize {
        self.percent_of_quota(self.cursor_dropping_checkpoint_mem_lower_mark)
    }

    pub fn mem_low_watermark_bytes(&self) -> usize {
        self.percent_of_quota(self.mem_low_watermark)
    }
}

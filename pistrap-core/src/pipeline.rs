//! The provisioning run, start to finish.
//!
//! [`Provisioner::execute`] drives one run: preflight, device selection, the
//! optional format, image acquisition, the write, partition detection and
//! customization. State travels between the stages in a [`RunContext`]; each
//! stage takes the context and hands back an updated one or an error.
//! Whatever happens, the run's outcome is persisted exactly once through a
//! [`RunGuard`], and temporary files and mounts are released by the guards
//! that own them.
use crate::answers::ProvisioningAnswers;
use crate::config::{ConfigStore, RunConfig};
use crate::customize;
use crate::device::{BlockDevice, DeviceClass};
use crate::error::{ProvisionError, Result};
use crate::format;
use crate::image::{self, ImageProvider, ImageSource, ResolvedImage};
use crate::inventory;
use crate::mount::MountScope;
use crate::partitions::{self, PartitionPair};
use crate::platform::Platform;
use crate::policy;
use crate::progress::Progress;
use crate::recovery::RunGuard;
use crate::tools;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

pub const WORK_DIR_ENV: &str = "PISTRAP_WORK_DIR";
const DEFAULT_WORK_DIR: &str = "/var/tmp/pistrap";
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Everything the pipeline needs from the person at the keyboard.
pub trait Operator {
    /// Picks one of `candidates`, returning its path.
    fn select_device(&self, candidates: &[BlockDevice]) -> Result<PathBuf>;

    fn confirm(&self, question: &str, default: bool) -> Result<bool>;

    /// Information the operator should see, such as a heuristic guess or
    /// recovery instructions.
    fn notice(&self, message: &str);
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Where downloads and decompressed images are written.
    pub work_dir: PathBuf,
    /// Parent of the temporary mount points.
    pub mount_dir: PathBuf,
    pub image_base_url: String,
    /// Fixed wait around partition table re-reads.
    pub settle_delay: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            mount_dir: std::env::temp_dir(),
            image_base_url: image::DEFAULT_BASE_URL.to_string(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl PipelineOptions {
    /// Defaults with `$PISTRAP_WORK_DIR` and `$PISTRAP_IMAGE_BASE_URL`
    /// applied.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(dir) = std::env::var_os(WORK_DIR_ENV) {
            options.work_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var(image::BASE_URL_ENV) {
            if !url.trim().is_empty() {
                options.image_base_url = url.trim().to_string();
            }
        }
        options
    }
}

/// State of one run as it moves through the stages.
#[derive(Debug)]
pub struct RunContext {
    pub answers: ProvisioningAnswers,
    pub device: Option<BlockDevice>,
    pub class: Option<DeviceClass>,
    pub formatted: bool,
    pub image: Option<ResolvedImage>,
    pub bytes_written: u64,
    pub partitions: Option<PartitionPair>,
}

impl RunContext {
    pub fn new(answers: ProvisioningAnswers) -> Self {
        Self {
            answers,
            device: None,
            class: None,
            formatted: false,
            image: None,
            bytes_written: 0,
            partitions: None,
        }
    }

    fn device(&self) -> Result<&BlockDevice> {
        self.device.as_ref().ok_or(ProvisionError::NoDeviceFound)
    }

    fn class(&self) -> DeviceClass {
        self.class.unwrap_or(DeviceClass::Unknown)
    }
}

/// What a successful run produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub device: PathBuf,
    pub class: DeviceClass,
    pub formatted: bool,
    pub bytes_written: u64,
    pub boot: PathBuf,
    pub root: PathBuf,
    pub username: String,
    /// Where to point `ssh` once the device has booted.
    pub host: String,
}

impl Summary {
    pub fn ssh_command(&self) -> String {
        format!("ssh {}@{}", self.username, self.host)
    }
}

pub struct Provisioner<'a, P: Platform + ?Sized> {
    platform: &'a P,
    operator: &'a dyn Operator,
    progress: &'a dyn Progress,
    running: &'a AtomicBool,
    options: PipelineOptions,
}

impl<'a, P: Platform + ?Sized> Provisioner<'a, P> {
    pub fn new(
        platform: &'a P,
        operator: &'a dyn Operator,
        progress: &'a dyn Progress,
        running: &'a AtomicBool,
        options: PipelineOptions,
    ) -> Self {
        Self {
            platform,
            operator,
            progress,
            running,
            options,
        }
    }

    /// Runs the whole pipeline. `config` is the previous run's record; it is
    /// updated with these answers and the outcome and saved to `store` once
    /// the run is over, whichever way it ends.
    pub fn execute(
        &self,
        answers: ProvisioningAnswers,
        store: ConfigStore,
        config: RunConfig,
    ) -> Result<Summary> {
        self.execute_guarded(answers, RunGuard::new(store, config))
    }

    /// Same as [`Provisioner::execute`], for a caller that armed the guard
    /// itself at the start of the run, before collecting `answers`.
    pub fn execute_guarded(
        &self,
        answers: ProvisioningAnswers,
        mut guard: RunGuard,
    ) -> Result<Summary> {
        guard.config_mut().record_answers(&answers);

        match self.run(RunContext::new(answers), &mut guard) {
            Ok(summary) => {
                guard.succeed();
                Ok(summary)
            }
            Err(e) => {
                if e.is_interrupted() {
                    log::warn!("{e}");
                } else {
                    log::error!("Provisioning failed: {e}");
                }
                for line in guard.fail() {
                    self.operator.notice(&line);
                }
                Err(e)
            }
        }
    }

    fn run(&self, ctx: RunContext, guard: &mut RunGuard) -> Result<Summary> {
        ctx.answers.validate()?;
        tools::preflight(self.platform, ctx.answers.password.is_some())?;

        let ctx = self.select(ctx)?;
        self.check_cancel()?;
        let ctx = self.confirm_and_format(ctx, guard)?;
        self.check_cancel()?;
        let ctx = self.acquire_image(ctx)?;
        self.check_cancel()?;
        let ctx = self.write(ctx, guard)?;
        self.check_cancel()?;
        let ctx = self.locate_partitions(ctx)?;
        self.check_cancel()?;
        let ctx = self.customize(ctx)?;
        // Consumes the context, which removes the temporary image files.
        self.summarize(ctx)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProvisionError::cancelled())
        }
    }

    fn select(&self, mut ctx: RunContext) -> Result<RunContext> {
        let all = self.platform.block_devices()?;
        let candidates = inventory::candidates(&all);
        if candidates.devices.is_empty() {
            return Err(ProvisionError::NoDeviceFound);
        }
        if candidates.fell_back {
            self.operator.notice(
                "No removable devices were found. Every non-system disk is listed, which may include internal drives.",
            );
        }

        let device = if let [only] = candidates.devices.as_slice() {
            self.operator
                .notice(&format!("Using the only candidate device: {only}"));
            only.clone()
        } else {
            let chosen = self.operator.select_device(&candidates.devices)?;
            candidates
                .devices
                .iter()
                .find(|d| d.path == chosen)
                .cloned()
                .ok_or_else(|| ProvisionError::InvalidSelection(chosen.display().to_string()))?
        };

        let class = device.class();
        log::info!(
            "Selected {} ({:.1} GB), classified as {}",
            device.path.display(),
            device.size_gb(),
            class
        );
        self.operator.notice(&format!(
            "{} looks like a {} ({:.1} GB). This guess is based on size only.",
            device.path.display(),
            class,
            device.size_gb()
        ));
        ctx.device = Some(device);
        ctx.class = Some(class);
        Ok(ctx)
    }

    /// Asks for the destructive confirmations, then formats if the operator
    /// accepted that too. Nothing on the device changes before this returns.
    fn confirm_and_format(&self, mut ctx: RunContext, guard: &mut RunGuard) -> Result<RunContext> {
        let device = ctx.device()?.clone();
        let class = ctx.class();

        let recommendation = policy::recommend(class);
        let wants_format = self.operator.confirm(
            &format!(
                "Format {} before writing? {}",
                device.path.display(),
                recommendation.reason
            ),
            recommendation.format_by_default(),
        )?;
        guard.config_mut().format_confirmed = Some(wants_format);

        let question = format!(
            "All data on {} ({:.1} GB, {}) will be destroyed. Continue?",
            device.path.display(),
            device.size_gb(),
            device.model
        );
        if !self.operator.confirm(&question, false)? {
            return Err(ProvisionError::Aborted("Operator declined to overwrite the device".into()));
        }
        if class.is_large() {
            let again = format!(
                "{} is larger than an SD card would usually be. Is it really the device to erase?",
                device.path.display()
            );
            if !self.operator.confirm(&again, false)? {
                return Err(ProvisionError::Aborted(
                    "Operator declined the second confirmation".into(),
                ));
            }
        }

        if wants_format {
            guard.device_touched(&device.path, class);
            format::apply(self.platform, &device.path, class, self.options.settle_delay)?;
            ctx.formatted = true;
        }
        Ok(ctx)
    }

    fn acquire_image(&self, mut ctx: RunContext) -> Result<RunContext> {
        let source = match &ctx.answers.local_image {
            Some(path) => ImageSource::Local(path.clone()),
            None => ImageSource::Remote(ctx.answers.architecture),
        };
        let provider = ImageProvider::new(
            self.options.image_base_url.clone(),
            self.options.work_dir.clone(),
            self.running,
            self.progress,
        );
        ctx.image = Some(provider.resolve(&source)?);
        Ok(ctx)
    }

    fn write(&self, mut ctx: RunContext, guard: &mut RunGuard) -> Result<RunContext> {
        let device = ctx.device()?.clone();
        let (image_path, image_size) = ctx
            .image
            .as_ref()
            .map(|i| (i.path.clone(), i.size))
            .ok_or_else(|| ProvisionError::ImageUnavailable(PathBuf::new()))?;

        if device.size_bytes > 0 && image_size > device.size_bytes {
            return Err(ProvisionError::WriteFailed {
                device: device.path.clone(),
                reason: format!(
                    "image is {} bytes but the device only holds {}",
                    image_size, device.size_bytes
                ),
            });
        }

        guard.device_touched(&device.path, ctx.class());
        self.platform.unmount_all(&device.path)?;
        ctx.bytes_written =
            self.platform
                .write_image(&image_path, &device.path, self.running, self.progress)?;
        self.platform.sync(&device.path)?;
        format::refresh_partition_table(self.platform, &device.path, self.options.settle_delay)?;
        Ok(ctx)
    }

    fn locate_partitions(&self, mut ctx: RunContext) -> Result<RunContext> {
        let device = ctx.device()?.path.clone();
        let pair = match partitions::locate(&device, &self.platform.partitions(&device)?) {
            Ok(pair) => pair,
            Err(first) => {
                log::warn!("{first}; checking once more");
                sleep(self.options.settle_delay);
                let parts = self.platform.partitions(&device)?;
                partitions::locate(&device, &parts).inspect_err(|_| {
                    self.operator.notice(&format!(
                        "Partitions seen on {}: {}",
                        device.display(),
                        partitions::describe(&parts)
                    ));
                })?
            }
        };
        log::info!(
            "Boot partition {}, root partition {}",
            pair.boot.display(),
            pair.root.display()
        );
        ctx.partitions = Some(pair);
        Ok(ctx)
    }

    fn customize(&self, ctx: RunContext) -> Result<RunContext> {
        let device = ctx.device()?.path.clone();
        let pair = ctx.partitions.as_ref().ok_or_else(|| ProvisionError::PartitionsNotFound {
            device: device.clone(),
            observed: "not scanned".into(),
        })?;

        let scope = MountScope::open(self.platform, pair, &self.options.mount_dir)?;
        customize::apply(self.platform, scope.boot_dir(), scope.root_dir(), &ctx.answers)?;
        scope.close()?;
        self.platform.sync(&device)?;
        Ok(ctx)
    }

    fn summarize(&self, ctx: RunContext) -> Result<Summary> {
        let device = ctx.device()?;
        let pair = ctx.partitions.clone().ok_or_else(|| ProvisionError::PartitionsNotFound {
            device: device.path.clone(),
            observed: "not scanned".into(),
        })?;
        let host = ctx
            .answers
            .network
            .as_ref()
            .map(|n| n.ip.clone())
            .unwrap_or_else(|| "raspberrypi.local".to_string());
        Ok(Summary {
            device: device.path.clone(),
            class: ctx.class(),
            formatted: ctx.formatted,
            bytes_written: ctx.bytes_written,
            boot: pair.boot,
            root: pair.root,
            username: ctx.answers.username.clone(),
            host,
        })
    }
}

/// Where this run's image comes from, for messages.
pub fn describe_source(answers: &ProvisioningAnswers, options: &PipelineOptions) -> String {
    match &answers.local_image {
        Some(path) => path.display().to_string(),
        None => image::latest_url(&options.image_base_url, answers.architecture),
    }
}

//! One state object per pipeline step.

use super::context::{ActiveExtract, UpdatePlan};
use super::{OpStatus, PendingOp, Step, Transition, UpdateContext, UpdateEvent};
use crate::engine::content::{ContentIndex, ContentError, ModuleReport};
use crate::engine::error::UpdateError;
use crate::engine::manifest::VersionedManifest;
use crate::engine::updater::{
    decide, ArchiveVerifier, DownloadError, ExtractError, ExtractJob, ExtractReport, InfoError,
    RemoteUpdateInfo, UpdateDecision, VerifyError,
};
use crate::engine::updater::download::DownloadResult;
use chrono::Utc;
use std::fs;
use std::ops::ControlFlow;
use std::path::Path;
use tracing::{debug, info, warn};

pub trait StepState: Send {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition;

    fn poll(&mut self, _ctx: &mut UpdateContext) -> Transition {
        Transition::Stay
    }

    fn on_exit(&mut self, _ctx: &mut UpdateContext) {}
}

pub(crate) fn for_step(step: Step) -> Box<dyn StepState> {
    match step {
        Step::RequestInfo => Box::new(RequestInfo::default()),
        Step::CheckNeed => Box::new(CheckNeed),
        Step::Download => Box::new(Download::default()),
        Step::Verify => Box::new(Verify::default()),
        Step::Extract => Box::new(Extract::default()),
        Step::ReloadManifest => Box::new(ReloadManifest::default()),
        Step::LoadModules => Box::new(LoadModules::default()),
        Step::RunEntry => Box::new(RunEntry),
        Step::Done => Box::new(Done),
        Step::Failed(_) => Box::new(Failed),
    }
}

#[derive(Default)]
struct RequestInfo {
    op: Option<PendingOp<Result<RemoteUpdateInfo, InfoError>>>,
}

impl RequestInfo {
    fn unavailable(ctx: &mut UpdateContext, reason: String) -> Transition {
        warn!(reason = %reason, "update info unavailable, continuing with local content");
        ctx.remote = None;
        ctx.events.emit(UpdateEvent::InfoUnavailable { reason });
        Transition::Goto(Step::CheckNeed)
    }
}

impl StepState for RequestInfo {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        ctx.remote = None;
        let Some(resolver) = ctx.resolver.clone() else {
            return Self::unavailable(ctx, "no info endpoint configured".to_string());
        };
        let local = ctx.state.version().to_string();
        self.op = Some(PendingOp::spawn(ctx.epoch.stamp(), async move {
            resolver.fetch(&local).await
        }));
        Transition::Stay
    }

    fn poll(&mut self, ctx: &mut UpdateContext) -> Transition {
        let Some(op) = self.op.as_mut() else {
            return Transition::Stay;
        };
        match op.poll() {
            OpStatus::Pending | OpStatus::Stale => Transition::Stay,
            OpStatus::Done(Ok(info)) => {
                debug!(resversion = %info.current.resversion, "update info stored");
                ctx.remote = Some(info);
                Transition::Goto(Step::CheckNeed)
            }
            OpStatus::Done(Err(e)) => Self::unavailable(ctx, e.to_string()),
            OpStatus::Lost => Self::unavailable(ctx, "info request task ended".to_string()),
        }
    }

    fn on_exit(&mut self, _ctx: &mut UpdateContext) {
        self.op = None;
    }
}

struct CheckNeed;

impl StepState for CheckNeed {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        let local = match ctx.state.version_number() {
            Ok(v) => v,
            Err(e) => return Transition::Fail(e.into()),
        };
        // Remote info only lives until the decision is made
        let remote = ctx.remote.take();
        let decision = decide(local, remote.as_ref(), Utc::now());

        match decision {
            UpdateDecision::Required { from, to, resource } => {
                let Some(info) = remote else {
                    return Transition::Fail(UpdateError::fatal("update required without remote info"));
                };
                let url = info.resource_url(&resource);
                let archive_path = ctx.layout.download_path(&resource.file);
                info!(from, to, url = %url, "update required");
                ctx.plan = Some(UpdatePlan {
                    from,
                    to,
                    url,
                    resource,
                    archive_path,
                });
                Transition::Goto(Step::Download)
            }
            UpdateDecision::UpToDate => {
                info!(local, "content up to date");
                ctx.plan = None;
                Transition::Goto(Step::ReloadManifest)
            }
            UpdateDecision::Maintenance => {
                warn!("server in maintenance, skipping update");
                ctx.plan = None;
                ctx.events.emit(UpdateEvent::Maintenance);
                Transition::Goto(Step::ReloadManifest)
            }
            UpdateDecision::Unavailable => {
                debug!(local, "no usable remote version, using local content");
                ctx.plan = None;
                Transition::Goto(Step::ReloadManifest)
            }
        }
    }
}

#[derive(Default)]
struct Download {
    op: Option<PendingOp<Result<DownloadResult, DownloadError>>>,
}

impl StepState for Download {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        let Some(plan) = ctx.plan.clone() else {
            return Transition::Fail(UpdateError::fatal("download entered without an update plan"));
        };
        ctx.state.take_pending_archive();

        let downloader = ctx.downloader.clone();
        let events = ctx.events.clone();
        let stamp = ctx.epoch.stamp();
        let guard = stamp.clone();
        let attempt = stamp.value();
        info!(url = %plan.url, dest = %plan.archive_path.display(), attempt, "downloading patch");

        self.op = Some(PendingOp::spawn(stamp, async move {
            let mut last_percent = None;
            downloader
                .download(&plan.url, &plan.archive_path, attempt, plan.resource.size, |progress| {
                    if !guard.is_current() {
                        return ControlFlow::Break(());
                    }
                    let fraction = progress.fraction();
                    let percent = (fraction * 100.0) as u32;
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        debug!(percent, downloaded = progress.downloaded, "download progress");
                        events.emit(UpdateEvent::DownloadProgress { fraction });
                    }
                    ControlFlow::Continue(())
                })
                .await
        }));
        Transition::Stay
    }

    fn poll(&mut self, ctx: &mut UpdateContext) -> Transition {
        let Some(op) = self.op.as_mut() else {
            return Transition::Stay;
        };
        match op.poll() {
            OpStatus::Pending | OpStatus::Stale => Transition::Stay,
            OpStatus::Done(Ok(result)) => {
                info!(bytes = result.bytes_downloaded, "download complete");
                ctx.events.emit(UpdateEvent::DownloadProgress { fraction: 1.0 });
                ctx.state.set_pending_archive(result.path);
                Transition::Goto(Step::Verify)
            }
            OpStatus::Done(Err(e)) => Transition::Fail(e.into()),
            OpStatus::Lost => Transition::Fail(UpdateError::fatal("download task ended without a result")),
        }
    }

    fn on_exit(&mut self, _ctx: &mut UpdateContext) {
        self.op = None;
    }
}

#[derive(Default)]
struct Verify {
    op: Option<PendingOp<Result<(), VerifyError>>>,
}

fn discard_archive(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(archive = %path.display(), "archive discarded"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(archive = %path.display(), error = %e, "failed to discard archive"),
    }
}

impl StepState for Verify {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        let Some(archive) = ctx.state.pending_archive().map(Path::to_path_buf) else {
            return Transition::Fail(UpdateError::fatal("no downloaded archive to verify"));
        };
        let digest = match ctx.plan.as_ref().and_then(|p| p.resource.digest()) {
            Some(digest) => digest,
            None => {
                discard_archive(&archive);
                ctx.state.take_pending_archive();
                return Transition::Fail(VerifyError::MissingDigest.into());
            }
        };

        info!(archive = %archive.display(), algorithm = %digest.algorithm, "verifying archive");
        self.op = Some(PendingOp::spawn_blocking(ctx.epoch.stamp(), move || {
            ArchiveVerifier::verify_file(&archive, &digest)
        }));
        Transition::Stay
    }

    fn poll(&mut self, ctx: &mut UpdateContext) -> Transition {
        let Some(op) = self.op.as_mut() else {
            return Transition::Stay;
        };
        match op.poll() {
            OpStatus::Pending | OpStatus::Stale => Transition::Stay,
            OpStatus::Done(Ok(())) => {
                debug!("archive digest matches");
                Transition::Goto(Step::Extract)
            }
            OpStatus::Done(Err(e)) => {
                if let Some(archive) = ctx.state.take_pending_archive() {
                    discard_archive(&archive);
                }
                Transition::Fail(e.into())
            }
            OpStatus::Lost => Transition::Fail(UpdateError::fatal("verification task ended without a result")),
        }
    }

    fn on_exit(&mut self, _ctx: &mut UpdateContext) {
        self.op = None;
    }
}

#[derive(Default)]
struct Extract {
    started: bool,
}

impl Extract {
    /// Start our worker unless a superseded one is still running.
    fn try_start(&mut self, ctx: &mut UpdateContext) -> Result<bool, UpdateError> {
        if let Some(previous) = ctx.extract.as_mut() {
            if previous.stamp.is_current() {
                return Ok(true);
            }
            match previous.job.try_take() {
                None => return Ok(false),
                Some(result) => {
                    debug!(
                        epoch = previous.stamp.value(),
                        ok = result.is_ok(),
                        "discarding superseded extraction result"
                    );
                    ctx.extract = None;
                }
            }
        }

        let archive = ctx
            .state
            .pending_archive()
            .map(Path::to_path_buf)
            .ok_or_else(|| UpdateError::fatal("no verified archive to extract"))?;
        let version = ctx
            .plan
            .as_ref()
            .map(|p| p.to.to_string())
            .ok_or_else(|| UpdateError::fatal("extract entered without an update plan"))?;
        let sandbox = ctx.state.sandbox_dir().to_path_buf();

        info!(archive = %archive.display(), sandbox = %sandbox.display(), "extracting patch");
        let job = ExtractJob::spawn(archive.clone(), sandbox).map_err(ExtractError::from)?;
        ctx.extract = Some(ActiveExtract {
            stamp: ctx.epoch.stamp(),
            job,
            archive,
            version,
        });
        Ok(true)
    }

    fn finish(
        ctx: &mut UpdateContext,
        active: ActiveExtract,
        result: Result<ExtractReport, ExtractError>,
    ) -> Transition {
        if !active.stamp.is_current() {
            return Transition::Stay;
        }
        match result {
            Ok(report) => {
                discard_archive(&active.archive);
                ctx.state.take_pending_archive();
                if let Err(e) = ctx.state.commit_version(&active.version) {
                    return Transition::Fail(e.into());
                }
                info!(version = %active.version, files = report.files, "patch applied");
                Transition::Goto(Step::ReloadManifest)
            }
            Err(e) => Transition::Fail(e.into()),
        }
    }
}

impl StepState for Extract {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        match self.try_start(ctx) {
            Ok(started) => {
                self.started = started;
                Transition::Stay
            }
            Err(e) => Transition::Fail(e),
        }
    }

    fn poll(&mut self, ctx: &mut UpdateContext) -> Transition {
        if !self.started {
            match self.try_start(ctx) {
                Ok(started) => self.started = started,
                Err(e) => return Transition::Fail(e),
            }
            return Transition::Stay;
        }

        let Some(active) = ctx.extract.as_mut() else {
            return Transition::Fail(UpdateError::fatal("extraction worker missing"));
        };
        match active.job.try_take() {
            None => Transition::Stay,
            Some(result) => match ctx.extract.take() {
                Some(active) => Self::finish(ctx, active, result),
                None => Transition::Stay,
            },
        }
    }
}

#[derive(Default)]
struct ReloadManifest {
    op: Option<PendingOp<Result<VersionedManifest, ContentError>>>,
}

impl StepState for ReloadManifest {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        ctx.content.point_at(ctx.state.sandbox_dir().to_path_buf());
        let version = ctx.state.version().to_string();
        let candidates = ctx.content.manifest_candidates(&version);
        info!(version = %version, "reloading content manifest");

        self.op = Some(PendingOp::spawn_blocking(ctx.epoch.stamp(), move || {
            ContentIndex::load_manifest(&candidates, &version)
        }));
        Transition::Stay
    }

    fn poll(&mut self, ctx: &mut UpdateContext) -> Transition {
        let Some(op) = self.op.as_mut() else {
            return Transition::Stay;
        };
        let result = match op.poll() {
            OpStatus::Pending | OpStatus::Stale => return Transition::Stay,
            OpStatus::Done(result) => result,
            OpStatus::Lost => return Transition::Fail(UpdateError::fatal("manifest reload task ended")),
        };

        match result {
            Ok(manifest) => {
                debug!(bundles = manifest.len(), "content manifest installed");
                ctx.content.install(manifest);
                Transition::Goto(Step::LoadModules)
            }
            Err(e) if ctx.settings.strict_manifest_reload => Transition::Fail(e.into()),
            Err(e) => {
                warn!(error = %e, "manifest reload failed, continuing");
                ctx.events.emit(UpdateEvent::ManifestReloadFailed {
                    reason: e.to_string(),
                });
                Transition::Goto(Step::LoadModules)
            }
        }
    }

    fn on_exit(&mut self, _ctx: &mut UpdateContext) {
        self.op = None;
    }
}

#[derive(Default)]
struct LoadModules {
    op: Option<PendingOp<ModuleReport>>,
}

impl StepState for LoadModules {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        ctx.state.clear_modules();
        let loader = ctx.loader.clone();
        let ids = ctx.settings.modules.clone();
        let index = ctx.content.manifest().is_some().then(|| ctx.content.clone());
        info!(modules = ids.len(), "loading modules");

        self.op = Some(PendingOp::spawn_blocking(ctx.epoch.stamp(), move || {
            loader.load_all(index.as_ref(), &ids)
        }));
        Transition::Stay
    }

    fn poll(&mut self, ctx: &mut UpdateContext) -> Transition {
        let Some(op) = self.op.as_mut() else {
            return Transition::Stay;
        };
        let report = match op.poll() {
            OpStatus::Pending | OpStatus::Stale => return Transition::Stay,
            OpStatus::Done(report) => report,
            OpStatus::Lost => return Transition::Fail(UpdateError::fatal("module loading task ended")),
        };

        for module in report.missing() {
            let err = UpdateError::ModuleLoad(module.to_string());
            warn!(error = %err, "module load failed");
            ctx.events.emit(UpdateEvent::ModuleMissing {
                module: module.to_string(),
            });
        }
        let loaded = report.loaded_count();
        for (id, slot) in report.slots {
            ctx.state.record_module(id, slot);
        }
        debug!(loaded, "module batch finished");
        Transition::Goto(Step::RunEntry)
    }

    fn on_exit(&mut self, _ctx: &mut UpdateContext) {
        self.op = None;
    }
}

struct RunEntry;

impl StepState for RunEntry {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        let missing = ctx.state.missing_modules();
        if !missing.is_empty() {
            warn!(missing = ?missing, "running entry point with unresolved modules");
        }
        match ctx.entry.run(ctx.state.modules()) {
            Ok(()) => Transition::Goto(Step::Done),
            Err(e) => Transition::Fail(e),
        }
    }
}

struct Done;

impl StepState for Done {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        let version = ctx.state.version().to_string();
        info!(version = %version, "update pipeline complete");
        ctx.plan = None;
        ctx.events.emit(UpdateEvent::Completed { version });
        Transition::Stay
    }
}

struct Failed;

impl StepState for Failed {
    fn on_enter(&mut self, ctx: &mut UpdateContext) -> Transition {
        ctx.plan = None;
        Transition::Stay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::coordinator::context::PipelineSettings;
    use crate::engine::coordinator::{Command, Coordinator, Outcome};
    use crate::engine::error::FailureCode;
    use crate::engine::manifest::{write_manifest, BundleEntry};
    use crate::engine::updater::remote::ResourceDescriptor;
    use crate::engine::updater::{DownloadOptions, Downloader, SandboxLayout};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn context(base: &Path) -> UpdateContext {
        let layout = SandboxLayout::with_base_dir(base.to_path_buf(), base.join("builtin"));
        let downloader = Downloader::new(&DownloadOptions::default()).unwrap();
        let settings = PipelineSettings {
            tick_interval: Duration::from_millis(1),
            ..PipelineSettings::default()
        };
        UpdateContext::new(settings, layout, None, downloader).unwrap()
    }

    fn write_patch(path: &Path) {
        let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
        writer.start_file("HotUpdate.dll", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"patched").unwrap();
        writer.finish().unwrap();
    }

    fn plan_for(ctx: &mut UpdateContext, archive: &Path, to: u64) {
        ctx.plan = Some(UpdatePlan {
            from: 3,
            to,
            url: String::new(),
            resource: ResourceDescriptor {
                file: "patch.zip".to_string(),
                ..ResourceDescriptor::default()
            },
            archive_path: archive.to_path_buf(),
        });
        ctx.state.set_pending_archive(archive.to_path_buf());
    }

    async fn settle(coordinator: &mut Coordinator) {
        for _ in 0..2000 {
            coordinator.tick();
            if coordinator.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("coordinator did not settle at {:?}", coordinator.step());
    }

    #[tokio::test]
    async fn test_without_endpoint_runs_on_local_content() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        fs::create_dir_all(ctx.layout.builtin_root()).unwrap();
        fs::write(ctx.layout.builtin_root().join("HotUpdate.dll"), b"builtin").unwrap();

        let (mut coordinator, _commands) = Coordinator::new(ctx);
        coordinator.start();
        settle(&mut coordinator).await;

        assert_eq!(
            coordinator.history(),
            &[
                Step::RequestInfo,
                Step::CheckNeed,
                Step::ReloadManifest,
                Step::LoadModules,
                Step::RunEntry,
                Step::Done
            ]
        );
        assert_eq!(
            coordinator.context().state().module("HotUpdate.dll").unwrap().bytes(),
            Some(&b"builtin"[..])
        );
    }

    #[tokio::test]
    async fn test_manifest_reload_soft_and_strict() {
        let dir = tempdir().unwrap();
        let (mut soft, _tx) = Coordinator::new(context(&dir.path().join("soft")));
        soft.start();
        settle(&mut soft).await;
        assert!(matches!(soft.outcome(), Some(Outcome::Completed { .. })));

        let mut ctx = context(&dir.path().join("strict"));
        ctx.settings.strict_manifest_reload = true;
        let (mut strict, _tx) = Coordinator::new(ctx);
        strict.start();
        settle(&mut strict).await;
        assert!(matches!(
            strict.outcome(),
            Some(Outcome::Failed { code: FailureCode::ManifestReload, .. })
        ));
    }

    #[tokio::test]
    async fn test_extract_commits_version_and_reloads() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());
        let archive = ctx.layout.download_path("patch.zip");
        write_patch(&archive);
        plan_for(&mut ctx, &archive, 5);
        let manifest = VersionedManifest::new(
            "DefaultPackage",
            "5",
            vec![BundleEntry::new("HotUpdate.dll", "p", "HotUpdate.dll", 7)],
        )
        .unwrap();
        write_manifest(&ctx.layout.sandbox_dir().join("DefaultPackage_5.bytes"), &manifest).unwrap();

        let (mut coordinator, _tx) = Coordinator::new(ctx);
        coordinator.force(Step::Extract);
        settle(&mut coordinator).await;

        let ctx = coordinator.context();
        assert_eq!(ctx.state().version(), "5");
        assert!(!archive.exists());
        assert!(ctx.content().manifest().is_some());
        assert_eq!(ctx.state().module("HotUpdate.dll").unwrap().bytes(), Some(&b"patched"[..]));
    }

    #[tokio::test]
    async fn test_superseded_extraction_does_not_commit() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());
        let archive = ctx.layout.download_path("patch.zip");
        write_patch(&archive);
        plan_for(&mut ctx, &archive, 5);

        let (mut coordinator, commands) = Coordinator::new(ctx);
        coordinator.force(Step::Extract);
        assert_eq!(coordinator.step(), Some(Step::Extract));

        // Abort before the worker result is applied
        commands.send(Command::Abort);
        settle(&mut coordinator).await;

        // Let the orphaned worker finish; its result is never applied
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.tick();

        assert_eq!(coordinator.step(), Some(Step::Failed(FailureCode::Fatal)));
        assert_eq!(coordinator.context().state().version(), "1");
    }

    #[tokio::test]
    async fn test_verify_mismatch_discards_archive() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());
        let archive = ctx.layout.download_path("patch.zip");
        write_patch(&archive);
        plan_for(&mut ctx, &archive, 5);
        if let Some(plan) = ctx.plan.as_mut() {
            plan.resource.md5 = "00000000000000000000000000000000".to_string();
        }

        let (mut coordinator, _tx) = Coordinator::new(ctx);
        coordinator.force(Step::Verify);
        settle(&mut coordinator).await;

        assert_eq!(coordinator.step(), Some(Step::Failed(FailureCode::Integrity)));
        assert!(!coordinator.history().contains(&Step::Extract));
        assert!(!archive.exists());
        assert_eq!(coordinator.context().state().version(), "1");
    }

    #[tokio::test]
    async fn test_verify_without_digest_is_integrity_failure() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());
        let archive = ctx.layout.download_path("patch.zip");
        write_patch(&archive);
        plan_for(&mut ctx, &archive, 5);
        if let Some(plan) = ctx.plan.as_mut() {
            plan.resource.md5 = String::new();
            plan.resource.sha256 = None;
        }

        let (mut coordinator, _tx) = Coordinator::new(ctx);
        coordinator.force(Step::Verify);
        settle(&mut coordinator).await;

        assert_eq!(coordinator.step(), Some(Step::Failed(FailureCode::Integrity)));
        assert!(!archive.exists());
        assert!(coordinator.context().state().pending_archive().is_none());
        assert_eq!(coordinator.context().state().version(), "1");
    }
}

use crate::error::{AppError, ImportWarning};
use crate::import::host::AssetHost;
use crate::import::request::{
    CollisionMode, ImportOutcome, ImportPlan, ImportRequest, ImportStrategy, ImportTask, ImportedObject,
};
use crate::utils::path_utils::{asset_basename, is_under, join_content, materials_folder, package_path, staging_folder};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Turns an import request into the editor state it describes, whatever is already there.
pub struct Reconciler<'h> {
    host: &'h dyn AssetHost,
}

impl<'h> Reconciler<'h> {
    pub fn new(host: &'h dyn AssetHost) -> Self {
        Self { host }
    }

    pub async fn plan(&self, request: &ImportRequest) -> Result<ImportPlan, AppError> {
        let target = request.target_asset_path();
        let exists = self.host.asset_exists(&target).await?;
        Ok(ImportPlan::for_request(request, exists))
    }

    #[instrument(skip_all, fields(source = %request.source_file, folder = %request.destination_folder))]
    pub async fn reconcile(&self, request: &ImportRequest) -> Result<ImportOutcome, AppError> {
        let plan = self.plan(request).await?;
        info!(target_asset = %plan.target_asset_path, strategy = ?plan.strategy, "Import planned");

        if !self.host.directory_exists(&request.destination_folder).await? {
            info!(folder = %request.destination_folder, "Creating destination folder");
            self.host.make_directory(&request.destination_folder).await?;
        }

        let mut warnings = Vec::new();
        let objects = match plan.strategy {
            ImportStrategy::ReimportInPlace => {
                let report = self.host.import(&import_task(request, &request.destination_folder, true), true).await?;
                warnings.extend(report.warnings);
                report.objects
            }
            ImportStrategy::FreshDirect => {
                let report = self.host.import(&import_task(request, &request.destination_folder, false), false).await?;
                warnings.extend(report.warnings);
                report.objects
            }
            ImportStrategy::FreshWithTempStaging => self.import_staged(request, &mut warnings).await?,
        };
        let mut objects = self.confirm_objects(&plan, objects, &mut warnings).await?;

        let materials_relocated = if request.options.import_materials && request.options.relocate_materials {
            self.relocate_materials(&request.destination_folder, &mut objects, &mut warnings).await
        } else {
            false
        };

        let collision = if request.options.complex_as_simple {
            self.apply_complex_collision(&objects, &mut warnings).await
        } else {
            CollisionMode::Unchanged
        };

        let outcome = ImportOutcome {
            asset_path: plan.target_asset_path,
            asset_paths: objects.iter().map(|o| package_path(&o.path).to_string()).collect(),
            created: !plan.asset_exists,
            strategy: plan.strategy,
            collision,
            materials_relocated,
            warnings,
        };
        info!(
            asset = %outcome.asset_path,
            created = outcome.created,
            objects = outcome.asset_paths.len(),
            warnings = outcome.warnings.len(),
            "Import reconciled"
        );
        Ok(outcome)
    }

    async fn import_staged(
        &self,
        request: &ImportRequest,
        warnings: &mut Vec<ImportWarning>,
    ) -> Result<Vec<ImportedObject>, AppError> {
        let token = Uuid::new_v4().simple().to_string();
        let staging = staging_folder(&request.destination_folder, &token[..8]);
        self.host.make_directory(&staging).await?;

        let result = self.move_out_of_staging(request, &staging, warnings).await;
        self.remove_staging(&staging, warnings).await;
        result
    }

    async fn move_out_of_staging(
        &self,
        request: &ImportRequest,
        staging: &str,
        warnings: &mut Vec<ImportWarning>,
    ) -> Result<Vec<ImportedObject>, AppError> {
        let report = self.host.import(&import_task(request, staging, false), false).await?;
        warnings.extend(report.warnings);

        let mut moved = Vec::with_capacity(report.objects.len());
        for object in report.objects {
            if !is_under(&object.path, staging) {
                moved.push(object);
                continue;
            }
            let destination = join_content(&request.destination_folder, asset_basename(&object.path));
            self.host.rename_asset(package_path(&object.path), &destination).await?;
            moved.push(ImportedObject::new(destination, object.class));
        }
        Ok(moved)
    }

    /// Staging is removed from the registry and from disk; failures only warn.
    async fn remove_staging(&self, staging: &str, warnings: &mut Vec<ImportWarning>) {
        if let Err(e) = self.host.delete_directory(staging).await {
            warn!(folder = %staging, error = %e, "Failed to delete staging folder");
            warnings.push(ImportWarning::reconciliation(format!("Staging folder {} not deleted: {}", staging, e)));
        }
        if let Err(e) = self.host.delete_directory_on_disk(staging).await {
            warn!(folder = %staging, error = %e, "Failed to delete staging folder on disk");
            warnings.push(ImportWarning::reconciliation(format!(
                "Staging folder {} left on disk: {}",
                staging, e
            )));
        }
    }

    /// An import that reports nothing is accepted only if the target is really there.
    async fn confirm_objects(
        &self,
        plan: &ImportPlan,
        objects: Vec<ImportedObject>,
        warnings: &mut Vec<ImportWarning>,
    ) -> Result<Vec<ImportedObject>, AppError> {
        if !objects.is_empty() {
            return Ok(objects);
        }
        if self.host.asset_exists(&plan.target_asset_path).await? {
            warnings.push(ImportWarning::reconciliation("Import completed but no assets were reported"));
            return Ok(vec![ImportedObject::new(plan.target_asset_path.clone(), "StaticMesh")]);
        }
        Err(AppError::Reconciliation(format!(
            "Import of {} produced no assets",
            plan.source_path
        )))
    }

    async fn relocate_materials(
        &self,
        destination_folder: &str,
        objects: &mut [ImportedObject],
        warnings: &mut Vec<ImportWarning>,
    ) -> bool {
        let target_folder = materials_folder(destination_folder);
        let mut folder_ready = false;
        let mut relocated = false;

        for object in objects.iter_mut().filter(|o| o.is_material_like()) {
            if is_under(&object.path, &target_folder) {
                continue;
            }
            if !folder_ready {
                if let Err(e) = self.ensure_directory(&target_folder).await {
                    warnings.push(ImportWarning::reconciliation(format!(
                        "Materials folder {} unavailable: {}",
                        target_folder, e
                    )));
                    return relocated;
                }
                folder_ready = true;
            }

            let destination = join_content(&target_folder, asset_basename(&object.path));
            let moved = match self.host.asset_exists(&destination).await {
                // A rerun regenerates the material next to the mesh; fold it into the relocated copy.
                Ok(true) => self.host.consolidate_assets(&destination, package_path(&object.path)).await,
                Ok(false) => self.host.rename_asset(package_path(&object.path), &destination).await,
                Err(e) => {
                    warnings.push(e.into());
                    continue;
                }
            };
            match moved {
                Ok(()) => {
                    object.path = destination;
                    relocated = true;
                }
                Err(e) => {
                    warn!(asset = %object.path, error = %e, "Failed to relocate material");
                    warnings.push(ImportWarning::reconciliation(format!(
                        "Could not move {} to {}: {}",
                        object.path, target_folder, e
                    )));
                }
            }
        }
        relocated
    }

    async fn ensure_directory(&self, folder: &str) -> Result<(), AppError> {
        if !self.host.directory_exists(folder).await? {
            self.host.make_directory(folder).await?;
        }
        Ok(())
    }

    async fn apply_complex_collision(
        &self,
        objects: &[ImportedObject],
        warnings: &mut Vec<ImportWarning>,
    ) -> CollisionMode {
        let mut applied = 0usize;
        let mut meshes = 0usize;
        for mesh in objects.iter().filter(|o| o.is_static_mesh()) {
            meshes += 1;
            match self.host.set_complex_as_simple(package_path(&mesh.path)).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(mesh = %mesh.path, error = %e, "Failed to set complex collision");
                    warnings.push(ImportWarning::reconciliation(format!(
                        "Complex-as-simple collision not applied to {}: {}",
                        mesh.path, e
                    )));
                }
            }
        }
        if meshes == 0 {
            warnings.push(ImportWarning::reconciliation("No static meshes to apply collision to"));
        }
        if applied > 0 {
            CollisionMode::ComplexAsSimple
        } else {
            CollisionMode::Unchanged
        }
    }
}

fn import_task(request: &ImportRequest, destination_path: &str, reimport: bool) -> ImportTask {
    ImportTask {
        filename: request.source_file.clone(),
        destination_path: destination_path.to_string(),
        destination_name: request.asset_name.clone(),
        replace_existing: true,
        // Reimport must keep the asset's identity, so its settings are replaced in place.
        replace_existing_settings: reimport,
        automated: true,
        save: true,
        options: request.options.clone(),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::import::request::ImportReport;
    use crate::utils::path_utils::parent_folder;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet, HashSet};
    use std::sync::Mutex;

    /// In-memory editor: an asset registry, a content directory and an operation log.
    #[derive(Default)]
    pub struct FakeState {
        pub assets: BTreeMap<String, String>,
        pub directories: BTreeSet<String>,
        pub on_disk: BTreeSet<String>,
        pub ops: Vec<String>,
        pub tasks: Vec<ImportTask>,
        /// (name, class) pairs each import produces; `{}` in a name becomes the destination name.
        pub produces: Vec<(String, String)>,
        pub failing: HashSet<&'static str>,
        pub collision: BTreeSet<String>,
        pub import_warning: Option<ImportWarning>,
    }

    #[derive(Default)]
    pub struct FakeHost {
        pub state: Mutex<FakeState>,
    }

    impl FakeHost {
        pub fn producing(items: &[(&str, &str)]) -> Self {
            let host = Self::default();
            host.state.lock().unwrap().produces =
                items.iter().map(|(n, c)| (n.to_string(), c.to_string())).collect();
            host
        }

        pub fn with_asset(self, path: &str, class: &str) -> Self {
            {
                let mut state = self.state.lock().unwrap();
                state.assets.insert(path.to_string(), class.to_string());
                state.directories.insert(parent_folder(path).to_string());
                state.on_disk.insert(parent_folder(path).to_string());
            }
            self
        }

        pub fn with_directory(self, path: &str) -> Self {
            self.state.lock().unwrap().directories.insert(path.to_string());
            self
        }

        pub fn failing(self, op: &'static str) -> Self {
            self.state.lock().unwrap().failing.insert(op);
            self
        }

        pub fn ops(&self) -> Vec<String> {
            self.state.lock().unwrap().ops.clone()
        }

        pub fn has_asset(&self, path: &str) -> bool {
            self.state.lock().unwrap().assets.contains_key(path)
        }

        fn begin(&self, op: &'static str, detail: &str) -> Result<std::sync::MutexGuard<'_, FakeState>, AppError> {
            let mut state = self.state.lock().unwrap();
            state.ops.push(format!("{} {}", op, detail));
            if state.failing.contains(op) {
                return Err(AppError::RemoteExecution { message: format!("{} failed", op), output: Vec::new() });
            }
            Ok(state)
        }
    }

    #[async_trait]
    impl AssetHost for FakeHost {
        async fn asset_exists(&self, path: &str) -> Result<bool, AppError> {
            let state = self.begin("asset_exists", path)?;
            Ok(state.assets.contains_key(package_path(path)))
        }

        async fn directory_exists(&self, path: &str) -> Result<bool, AppError> {
            let state = self.begin("directory_exists", path)?;
            Ok(state.directories.contains(path))
        }

        async fn make_directory(&self, path: &str) -> Result<(), AppError> {
            let mut state = self.begin("make_directory", path)?;
            state.directories.insert(path.to_string());
            state.on_disk.insert(path.to_string());
            Ok(())
        }

        async fn import(&self, task: &ImportTask, _replacing: bool) -> Result<ImportReport, AppError> {
            let mut state = self.begin("import", &task.destination_path)?;
            state.tasks.push(task.clone());
            let produced: Vec<(String, String)> = state.produces.clone();
            let mut objects = Vec::new();
            for (name, class) in produced {
                let name = name.replace("{}", &task.destination_name);
                let path = join_content(&task.destination_path, &name);
                state.assets.insert(path.clone(), class.clone());
                objects.push(ImportedObject::new(format!("{}.{}", path, name), class));
            }
            state.on_disk.insert(task.destination_path.clone());
            let warnings = state.import_warning.clone().into_iter().collect();
            Ok(ImportReport { objects, warnings })
        }

        async fn rename_asset(&self, from: &str, to: &str) -> Result<(), AppError> {
            let mut state = self.begin("rename_asset", &format!("{} -> {}", from, to))?;
            if state.assets.contains_key(to) {
                return Err(AppError::RemoteExecution { message: format!("{} exists", to), output: Vec::new() });
            }
            let class = state
                .assets
                .remove(from)
                .ok_or_else(|| AppError::RemoteExecution { message: format!("{} missing", from), output: Vec::new() })?;
            state.assets.insert(to.to_string(), class);
            Ok(())
        }

        async fn consolidate_assets(&self, keep: &str, duplicate: &str) -> Result<(), AppError> {
            let mut state = self.begin("consolidate_assets", &format!("{} <- {}", keep, duplicate))?;
            if !state.assets.contains_key(keep) {
                return Err(AppError::RemoteExecution { message: format!("{} missing", keep), output: Vec::new() });
            }
            state
                .assets
                .remove(duplicate)
                .ok_or_else(|| AppError::RemoteExecution { message: format!("{} missing", duplicate), output: Vec::new() })?;
            Ok(())
        }

        async fn delete_directory(&self, path: &str) -> Result<(), AppError> {
            let mut state = self.begin("delete_directory", path)?;
            state.assets.retain(|asset, _| !is_under(asset, path));
            state.directories.remove(path);
            Ok(())
        }

        async fn delete_directory_on_disk(&self, path: &str) -> Result<(), AppError> {
            let mut state = self.begin("delete_directory_on_disk", path)?;
            state.on_disk.remove(path);
            Ok(())
        }

        async fn set_complex_as_simple(&self, mesh_path: &str) -> Result<(), AppError> {
            let mut state = self.begin("set_complex_as_simple", mesh_path)?;
            if !state.assets.contains_key(mesh_path) {
                return Err(AppError::RemoteExecution { message: format!("{} missing", mesh_path), output: Vec::new() });
            }
            state.collision.insert(mesh_path.to_string());
            Ok(())
        }

        async fn list_assets(&self, folder: &str) -> Result<Vec<ImportedObject>, AppError> {
            let state = self.begin("list_assets", folder)?;
            Ok(state
                .assets
                .iter()
                .filter(|(path, _)| parent_folder(path) == folder)
                .map(|(path, class)| ImportedObject::new(path.clone(), class.clone()))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeHost;
    use super::*;
    use crate::config::StagingStrategy;
    use crate::error::WarningKind;
    use crate::import::request::ImportOptions;
    use crate::utils::path_utils::is_staging_path;
    use std::path::PathBuf;

    fn request(staging: StagingStrategy, options: ImportOptions) -> ImportRequest {
        ImportRequest::new(&PathBuf::from("/tmp/out/Rock.fbx"), "/Game/Imports", options, staging).unwrap()
    }

    fn rock_host() -> FakeHost {
        FakeHost::producing(&[("{}", "StaticMesh"), ("M_Rock", "Material")])
    }

    #[tokio::test]
    async fn fresh_import_into_missing_folder() {
        let host = rock_host();
        let outcome = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::Direct, ImportOptions::default()))
            .await
            .unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.asset_path, "/Game/Imports/Rock");
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert!(outcome.materials_relocated);
        assert!(host.has_asset("/Game/Imports/Rock"));
        assert!(host.has_asset("/Game/Imports/Materials/M_Rock"));
        assert!(!host.has_asset("/Game/Imports/M_Rock"));
        assert!(host.ops().contains(&"make_directory /Game/Imports".to_string()));
        assert_eq!(outcome.collision, CollisionMode::Unchanged);
    }

    #[tokio::test]
    async fn fresh_import_with_complex_collision_has_no_warnings() {
        let host = rock_host();
        let options = ImportOptions { complex_as_simple: true, ..ImportOptions::default() };
        let outcome = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::Direct, options))
            .await
            .unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.asset_path, "/Game/Imports/Rock");
        assert_eq!(outcome.collision, CollisionMode::ComplexAsSimple);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        let ops = host.ops();
        let import_at = ops.iter().position(|op| op.starts_with("import ")).unwrap();
        let collision_at = ops.iter().position(|op| op.starts_with("set_complex_as_simple")).unwrap();
        assert!(import_at < collision_at);
    }

    #[tokio::test]
    async fn reimport_replaces_in_place_without_deleting() {
        let host = rock_host()
            .with_asset("/Game/Imports/Rock", "StaticMesh")
            .with_asset("/Game/Imports/Materials/M_Old", "Material");
        let options = ImportOptions { complex_as_simple: true, ..ImportOptions::default() };
        let outcome = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::TempStaging, options))
            .await
            .unwrap();

        assert!(!outcome.created);
        assert_eq!(outcome.strategy, ImportStrategy::ReimportInPlace);
        assert_eq!(outcome.collision, CollisionMode::ComplexAsSimple);
        let ops = host.ops();
        assert!(ops.iter().all(|op| !op.starts_with("delete_directory")), "{:?}", ops);
        assert!(ops.iter().all(|op| !op.starts_with("rename_asset /Game/Imports/Rock ")), "{:?}", ops);
        assert!(!ops.iter().any(|op| op.starts_with("make_directory") && is_staging_path(op)));

        let state = host.state.lock().unwrap();
        let task = &state.tasks[0];
        assert!(task.replace_existing && task.replace_existing_settings);
        assert_eq!(task.destination_path, "/Game/Imports");
        assert!(state.collision.contains("/Game/Imports/Rock"));
        assert!(state.assets.contains_key("/Game/Imports/Materials/M_Old"));
    }

    #[tokio::test]
    async fn reimport_twice_is_idempotent() {
        let host = rock_host();
        let reconciler = Reconciler::new(&host);
        let first = reconciler.reconcile(&request(StagingStrategy::Direct, ImportOptions::default())).await.unwrap();
        let second = reconciler.reconcile(&request(StagingStrategy::Direct, ImportOptions::default())).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.strategy, ImportStrategy::ReimportInPlace);
        assert!(second.warnings.is_empty(), "{:?}", second.warnings);
        assert!(second.materials_relocated);
        assert_eq!(first.asset_paths, second.asset_paths);

        let state = host.state.lock().unwrap();
        let assets: Vec<&str> = state.assets.keys().map(String::as_str).collect();
        assert_eq!(assets, vec!["/Game/Imports/Materials/M_Rock", "/Game/Imports/Rock"]);
        assert!(state.ops.iter().any(|op| op.starts_with("consolidate_assets /Game/Imports/Materials/M_Rock")));
    }

    #[tokio::test]
    async fn failed_reimport_is_an_error_even_though_the_asset_exists() {
        use crate::import::host::{RemoteAssetHost, RESULT_PREFIX};
        use crate::remote::executor::testing::{reply, respond, ScriptedSink};
        use crate::remote::executor::CommandExecutor;

        let exists = format!("{}true", RESULT_PREFIX);
        let exists_again = exists.clone();
        let sink = ScriptedSink::new(vec![
            respond(|_| Ok(Some(reply(true, &[], None, None)))),
            respond(move |_| Ok(Some(reply(true, &[exists.as_str()], None, None)))),
            respond(move |_| Ok(Some(reply(true, &[exists_again.as_str()], None, None)))),
            respond(|_| {
                Ok(Some(reply(false, &["LogFbx: Error: invalid FBX header"], None, Some("ImportError: bad file"))))
            }),
        ]);
        let host = RemoteAssetHost::new(CommandExecutor::new(&sink));
        let err = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::Direct, ImportOptions::default()))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::RemoteExecution { .. }), "{:?}", err);
        assert_eq!(sink.sent.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn temp_staging_leaves_nothing_behind() {
        let host = rock_host().with_directory("/Game/Imports");
        let outcome = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::TempStaging, ImportOptions::default()))
            .await
            .unwrap();

        assert_eq!(outcome.strategy, ImportStrategy::FreshWithTempStaging);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        let state = host.state.lock().unwrap();
        assert!(state.assets.keys().all(|path| !is_staging_path(path)), "{:?}", state.assets);
        assert!(state.directories.iter().all(|path| !is_staging_path(path)));
        assert!(state.on_disk.iter().all(|path| !is_staging_path(path)), "{:?}", state.on_disk);
        assert!(state.assets.contains_key("/Game/Imports/Rock"));
        assert!(state.assets.contains_key("/Game/Imports/Materials/M_Rock"));
        assert!(!state.tasks[0].replace_existing_settings);
        assert!(is_staging_path(&state.tasks[0].destination_path));
    }

    #[tokio::test]
    async fn failed_staged_import_still_cleans_up() {
        let host = rock_host().with_directory("/Game/Imports").failing("import");
        let err = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::TempStaging, ImportOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RemoteExecution { .. }));
        let state = host.state.lock().unwrap();
        assert!(state.directories.iter().all(|path| !is_staging_path(path)));
        assert!(state.on_disk.iter().all(|path| !is_staging_path(path)));
    }

    #[tokio::test]
    async fn cleanup_failure_is_a_warning() {
        let host = rock_host().with_directory("/Game/Imports").failing("delete_directory_on_disk");
        let outcome = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::TempStaging, ImportOptions::default()))
            .await
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].message.contains("left on disk"));
        assert!(host.has_asset("/Game/Imports/Rock"));
    }

    #[tokio::test]
    async fn collision_applies_to_every_mesh() {
        let host = FakeHost::producing(&[("{}_A", "StaticMesh"), ("{}_B", "StaticMesh"), ("M_Rock", "Material")]);
        let options = ImportOptions { complex_as_simple: true, combine_meshes: false, ..ImportOptions::default() };
        let outcome = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::Direct, options))
            .await
            .unwrap();

        assert_eq!(outcome.collision, CollisionMode::ComplexAsSimple);
        let state = host.state.lock().unwrap();
        assert!(state.collision.contains("/Game/Imports/Rock_A"));
        assert!(state.collision.contains("/Game/Imports/Rock_B"));
        assert_eq!(state.collision.len(), 2);
        assert!(!state.tasks[0].options.combine_meshes);
    }

    #[tokio::test]
    async fn collision_failure_is_a_warning() {
        let host = rock_host().failing("set_complex_as_simple");
        let options = ImportOptions { complex_as_simple: true, ..ImportOptions::default() };
        let outcome = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::Direct, options))
            .await
            .unwrap();
        assert_eq!(outcome.collision, CollisionMode::Unchanged);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, WarningKind::Reconciliation);
    }

    #[tokio::test]
    async fn materials_stay_put_when_disabled() {
        let host = rock_host();
        let options = ImportOptions { relocate_materials: false, ..ImportOptions::default() };
        let outcome = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::Direct, options))
            .await
            .unwrap();
        assert!(!outcome.materials_relocated);
        assert!(host.has_asset("/Game/Imports/M_Rock"));
    }

    #[tokio::test]
    async fn remote_warning_is_carried_to_the_outcome() {
        let host = rock_host();
        host.state.lock().unwrap().import_warning = Some(ImportWarning::remote("Exception after import"));
        let outcome = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::Direct, ImportOptions::default()))
            .await
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, WarningKind::RemoteExecution);
        assert!(host.has_asset("/Game/Imports/Rock"));
    }

    #[tokio::test]
    async fn empty_report_without_asset_is_an_error() {
        let host = FakeHost::producing(&[]);
        let err = Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::Direct, ImportOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Reconciliation(_)));
    }

    #[tokio::test]
    async fn existence_check_failure_aborts_before_import() {
        let host = rock_host().failing("asset_exists");
        assert!(Reconciler::new(&host)
            .reconcile(&request(StagingStrategy::Direct, ImportOptions::default()))
            .await
            .is_err());
        assert!(host.state.lock().unwrap().tasks.is_empty());
    }
}

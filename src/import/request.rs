use crate::config::StagingStrategy;
use crate::error::{AppError, ImportWarning};
use crate::utils::path_utils::{
    asset_name_from_file, join_content, normalize_content_folder, to_editor_path,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Editor-side import toggles. Passed explicitly; never read from ambient settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
    pub import_materials: bool,
    pub import_textures: bool,
    pub combine_meshes: bool,
    pub auto_generate_collision: bool,
    pub generate_lightmap_uvs: bool,
    pub complex_as_simple: bool,
    pub relocate_materials: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            import_materials: true,
            import_textures: true,
            combine_meshes: true,
            auto_generate_collision: true,
            generate_lightmap_uvs: true,
            complex_as_simple: false,
            relocate_materials: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    /// Source artifact as the editor should read it (forward slashes).
    pub source_file: String,
    pub destination_folder: String,
    pub asset_name: String,
    pub options: ImportOptions,
    pub staging: StagingStrategy,
}

impl ImportRequest {
    pub fn new(
        source_file: &Path,
        destination_folder: &str,
        options: ImportOptions,
        staging: StagingStrategy,
    ) -> Result<Self, AppError> {
        let source_file = to_editor_path(source_file);
        let asset_name = asset_name_from_file(&source_file);
        if asset_name.is_empty() {
            return Err(AppError::InvalidInput(format!("Cannot derive an asset name from {}", source_file)));
        }
        Ok(Self {
            destination_folder: normalize_content_folder(destination_folder)?,
            source_file,
            asset_name,
            options,
            staging,
        })
    }

    pub fn target_asset_path(&self) -> String {
        join_content(&self.destination_folder, &self.asset_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportStrategy {
    ReimportInPlace,
    FreshDirect,
    FreshWithTempStaging,
}

/// Derived once per request from a single existence check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportPlan {
    pub target_asset_path: String,
    pub source_path: String,
    pub asset_exists: bool,
    pub strategy: ImportStrategy,
}

impl ImportPlan {
    pub fn for_request(request: &ImportRequest, asset_exists: bool) -> Self {
        let strategy = match (asset_exists, request.staging) {
            (true, _) => ImportStrategy::ReimportInPlace,
            (false, StagingStrategy::Direct) => ImportStrategy::FreshDirect,
            (false, StagingStrategy::TempStaging) => ImportStrategy::FreshWithTempStaging,
        };
        Self {
            target_asset_path: request.target_asset_path(),
            source_path: request.source_file.clone(),
            asset_exists,
            strategy,
        }
    }
}

/// One editor import job, serialized as-is for the remote dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportTask {
    pub filename: String,
    pub destination_path: String,
    pub destination_name: String,
    pub replace_existing: bool,
    pub replace_existing_settings: bool,
    pub automated: bool,
    pub save: bool,
    pub options: ImportOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedObject {
    pub path: String,
    #[serde(default)]
    pub class: String,
}

impl ImportedObject {
    pub fn new(path: impl Into<String>, class: impl Into<String>) -> Self {
        Self { path: path.into(), class: class.into() }
    }

    pub fn is_static_mesh(&self) -> bool {
        self.class == "StaticMesh"
    }

    /// Materials, material instances and their textures all move together.
    pub fn is_material_like(&self) -> bool {
        self.class.starts_with("Material") || self.class.starts_with("Texture")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub objects: Vec<ImportedObject>,
    pub warnings: Vec<ImportWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionMode {
    Unchanged,
    ComplexAsSimple,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub asset_path: String,
    /// Final location of every object the import produced.
    pub asset_paths: Vec<String>,
    pub created: bool,
    pub strategy: ImportStrategy,
    pub collision: CollisionMode,
    pub materials_relocated: bool,
    pub warnings: Vec<ImportWarning>,
}

//! Pipeline configuration and its validating builder.

use super::EngineSettings;
use crate::core::{StageId, StageMap};
use crate::errors::ConfigError;
use crate::utils::{parse_episode_date, slugify};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Which episode of a show to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum EpisodeFilter {
    /// The most recent episode.
    Latest,
    /// The episode published on this date.
    Date(NaiveDate),
    /// The first episode whose title contains this text.
    Title(String),
}

/// Where the source media comes from. Exactly one per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSelector {
    /// A show looked up by name, narrowed by a filter.
    Show {
        /// Show name.
        name: String,
        /// Episode filter.
        filter: EpisodeFilter,
    },
    /// A direct media or page URL.
    Url(String),
}

impl SourceSelector {
    /// Stable identity used for manifest records: `show/leaf` or the URL slug.
    #[must_use]
    pub fn episode_id(&self) -> String {
        match self {
            Self::Show { name, filter } => {
                let leaf = match filter {
                    EpisodeFilter::Latest => "latest".to_string(),
                    EpisodeFilter::Date(date) => date.to_string(),
                    EpisodeFilter::Title(title) => slugify(title),
                };
                format!("{}/{}", slugify(name), leaf)
            }
            Self::Url(url) => url_slug(url),
        }
    }

    /// The show name, if this selector names one.
    #[must_use]
    pub fn show(&self) -> Option<&str> {
        match self {
            Self::Show { name, .. } => Some(name),
            Self::Url(_) => None,
        }
    }
}

fn url_slug(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url).trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let stem = last.rsplit_once('.').map_or(last, |(stem, _)| stem);
    slugify(stem)
}

/// Numeric precision for speech recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePrecision {
    /// 8-bit integer quantization.
    #[default]
    Int8,
    /// Half precision.
    Float16,
    /// Full precision.
    Float32,
}

impl fmt::Display for ComputePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int8 => write!(f, "int8"),
            Self::Float16 => write!(f, "float16"),
            Self::Float32 => write!(f, "float32"),
        }
    }
}

/// Parameters for transcribe and the transcript-refining stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionParams {
    /// Recognition model name.
    pub model: String,
    /// Compute precision.
    pub compute: ComputePrecision,
    /// Language hint; detected when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl TranscriptionParams {
    /// Slug naming this model's transcript artifacts.
    #[must_use]
    pub fn artifact_variant(&self) -> String {
        slugify(&self.model)
    }
}

impl Default for TranscriptionParams {
    fn default() -> Self {
        Self {
            model: "large-v3".to_string(),
            compute: ComputePrecision::default(),
            language: None,
        }
    }
}

/// Parameters for the analyze stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisParams {
    /// Analysis template name.
    pub template: String,
    /// Language model; the unit's default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AnalysisParams {
    /// Slug naming this template's analysis artifact.
    #[must_use]
    pub fn artifact_variant(&self) -> String {
        slugify(&self.template)
    }
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            template: "general".to_string(),
            model: None,
        }
    }
}

/// Parameters for the export stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportParams {
    /// Output formats (srt, vtt, md, ...).
    pub formats: Vec<String>,
}

impl Default for ExportParams {
    fn default() -> Self {
        Self {
            formats: vec!["srt".to_string(), "vtt".to_string(), "md".to_string()],
        }
    }
}

/// Parameters for the publish stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishParams {
    /// Destination identifier (e.g. a database or channel id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// An immutable, validated description of one pipeline run.
///
/// Build with [`PipelineConfig::builder`]. Concurrent runs may share one
/// config; nothing mutates it after `build`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    source: SourceSelector,
    workdir: PathBuf,
    stages: BTreeSet<StageId>,
    transcription: TranscriptionParams,
    analysis: AnalysisParams,
    export: ExportParams,
    publish: PublishParams,
    verbose: bool,
    clean_intermediates: bool,
    skip_completed: bool,
}

impl PipelineConfig {
    /// Starts a builder with default stages (fetch, normalize, transcribe).
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Starts a builder rooted at `settings.output_root`.
    #[must_use]
    pub fn builder_from(settings: &EngineSettings) -> PipelineConfigBuilder {
        PipelineConfigBuilder::from_settings(settings)
    }

    /// The source selector.
    #[must_use]
    pub fn source(&self) -> &SourceSelector {
        &self.source
    }

    /// The working directory for this unit of work.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Requested stages, in canonical order.
    #[must_use]
    pub fn stages(&self) -> &BTreeSet<StageId> {
        &self.stages
    }

    /// Returns true if `stage` was requested.
    #[must_use]
    pub fn requests(&self, stage: StageId) -> bool {
        self.stages.contains(&stage)
    }

    /// Transcription parameters.
    #[must_use]
    pub fn transcription(&self) -> &TranscriptionParams {
        &self.transcription
    }

    /// Analysis parameters.
    #[must_use]
    pub fn analysis(&self) -> &AnalysisParams {
        &self.analysis
    }

    /// Export parameters.
    #[must_use]
    pub fn export(&self) -> &ExportParams {
        &self.export
    }

    /// Publish parameters.
    #[must_use]
    pub fn publish(&self) -> &PublishParams {
        &self.publish
    }

    /// Verbose output.
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Remove superseded intermediate artifacts after a successful run.
    #[must_use]
    pub fn clean_intermediates(&self) -> bool {
        self.clean_intermediates
    }

    /// Skip stages whose output already exists.
    #[must_use]
    pub fn skip_completed(&self) -> bool {
        self.skip_completed
    }

    /// Manifest identity of this unit of work.
    #[must_use]
    pub fn episode_id(&self) -> String {
        self.source.episode_id()
    }

    /// The artifact variant a stage writes under this config.
    ///
    /// Transcript stages are keyed by recognition model, analysis by
    /// template; other stages have a single artifact.
    #[must_use]
    pub fn artifact_variant(&self, stage: StageId) -> Option<String> {
        match stage {
            StageId::Transcribe | StageId::Align | StageId::Diarize | StageId::Restore => {
                Some(self.transcription.artifact_variant())
            }
            StageId::Analyze => Some(self.analysis.artifact_variant()),
            StageId::Fetch | StageId::Normalize | StageId::Export | StageId::Publish => None,
        }
    }

    /// The model a stage runs with, as recorded in the manifest.
    #[must_use]
    pub fn model_for(&self, stage: StageId) -> Option<&str> {
        match stage {
            StageId::Transcribe | StageId::Align | StageId::Diarize | StageId::Restore => {
                Some(&self.transcription.model)
            }
            StageId::Analyze => self.analysis.model.as_deref(),
            StageId::Fetch | StageId::Normalize | StageId::Export | StageId::Publish => None,
        }
    }

    /// Per-stage preferred artifact variants, for detection.
    #[must_use]
    pub fn artifact_variants(&self) -> StageMap<Option<String>> {
        StageMap::from_fn(|stage| self.artifact_variant(stage))
    }

    /// Named parameters handed to the stage unit.
    ///
    /// Also the input of the run-state parameter hash, so a changed value
    /// re-runs the stage.
    #[must_use]
    pub fn stage_params(&self, stage: StageId) -> serde_json::Value {
        match stage {
            StageId::Fetch => json!({ "source": self.source }),
            StageId::Normalize => json!({}),
            StageId::Transcribe | StageId::Align | StageId::Diarize | StageId::Restore => {
                to_params(&self.transcription)
            }
            StageId::Analyze => to_params(&self.analysis),
            StageId::Export => to_params(&self.export),
            StageId::Publish => to_params(&self.publish),
        }
    }
}

/// Serializes typed stage parameters into the unit's `params` object.
pub(crate) fn to_params<P: Serialize>(params: &P) -> serde_json::Value {
    serde_json::to_value(params).unwrap_or_else(|_| json!({}))
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    show: Option<String>,
    url: Option<String>,
    date: Option<String>,
    title: Option<String>,
    workdir: Option<PathBuf>,
    output_root: PathBuf,
    stages: BTreeSet<StageId>,
    transcription: TranscriptionParams,
    analysis: AnalysisParams,
    export: ExportParams,
    publish: PublishParams,
    verbose: bool,
    clean_intermediates: bool,
    skip_completed: bool,
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self {
            show: None,
            url: None,
            date: None,
            title: None,
            workdir: None,
            output_root: PathBuf::from("."),
            stages: [StageId::Fetch, StageId::Normalize, StageId::Transcribe]
                .into_iter()
                .collect(),
            transcription: TranscriptionParams::default(),
            analysis: AnalysisParams::default(),
            export: ExportParams::default(),
            publish: PublishParams::default(),
            verbose: false,
            clean_intermediates: false,
            skip_completed: true,
        }
    }
}

impl PipelineConfigBuilder {
    /// Selects a show by name.
    #[must_use]
    pub fn show(mut self, name: impl Into<String>) -> Self {
        self.show = Some(name.into());
        self
    }

    /// Selects a direct URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Narrows the show to the episode published on `date`.
    #[must_use]
    pub fn date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    /// Narrows the show to the episode whose title contains `title`.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Uses an explicit working directory instead of deriving one.
    #[must_use]
    pub fn workdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.workdir = Some(path.into());
        self
    }

    /// A builder whose derived working directories live under
    /// `settings.output_root`.
    #[must_use]
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::default().output_root(settings.output_root.clone())
    }

    /// Root under which working directories are derived.
    #[must_use]
    pub fn output_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_root = path.into();
        self
    }

    /// Replaces the requested stage set.
    #[must_use]
    pub fn stages(mut self, stages: impl IntoIterator<Item = StageId>) -> Self {
        self.stages = stages.into_iter().collect();
        self
    }

    /// Replaces the requested stage set from stage names.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownStage` for a name that matches no stage.
    pub fn stage_names<S: AsRef<str>>(
        self,
        names: impl IntoIterator<Item = S>,
    ) -> Result<Self, ConfigError> {
        let stages = names
            .into_iter()
            .map(|name| {
                name.as_ref()
                    .parse::<StageId>()
                    .map_err(|_| ConfigError::UnknownStage(name.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.stages(stages))
    }

    fn toggle(mut self, stage: StageId, enabled: bool) -> Self {
        if enabled {
            self.stages.insert(stage);
        } else {
            self.stages.remove(&stage);
        }
        self
    }

    /// Toggles word alignment.
    #[must_use]
    pub fn align(self, enabled: bool) -> Self {
        self.toggle(StageId::Align, enabled)
    }

    /// Toggles speaker labeling.
    #[must_use]
    pub fn diarize(self, enabled: bool) -> Self {
        self.toggle(StageId::Diarize, enabled)
    }

    /// Toggles transcript cleanup/restoration.
    #[must_use]
    pub fn restore(self, enabled: bool) -> Self {
        self.toggle(StageId::Restore, enabled)
    }

    /// Toggles analysis.
    #[must_use]
    pub fn analyze(self, enabled: bool) -> Self {
        self.toggle(StageId::Analyze, enabled)
    }

    /// Toggles export.
    #[must_use]
    pub fn export(self, enabled: bool) -> Self {
        self.toggle(StageId::Export, enabled)
    }

    /// Toggles publishing.
    #[must_use]
    pub fn publish(self, enabled: bool) -> Self {
        self.toggle(StageId::Publish, enabled)
    }

    /// Sets the recognition model.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.transcription.model = model.into();
        self
    }

    /// Sets the compute precision.
    #[must_use]
    pub fn compute(mut self, compute: ComputePrecision) -> Self {
        self.transcription.compute = compute;
        self
    }

    /// Sets the language hint.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.transcription.language = Some(language.into());
        self
    }

    /// Sets the analysis template.
    #[must_use]
    pub fn analysis_template(mut self, template: impl Into<String>) -> Self {
        self.analysis.template = template.into();
        self
    }

    /// Sets the analysis model.
    #[must_use]
    pub fn analysis_model(mut self, model: impl Into<String>) -> Self {
        self.analysis.model = Some(model.into());
        self
    }

    /// Sets the export formats.
    #[must_use]
    pub fn export_formats<S: Into<String>>(mut self, formats: impl IntoIterator<Item = S>) -> Self {
        self.export.formats = formats.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the publish destination.
    #[must_use]
    pub fn publish_destination(mut self, destination: impl Into<String>) -> Self {
        self.publish.destination = Some(destination.into());
        self
    }

    /// Enables verbose output.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Removes superseded intermediates after a successful run.
    #[must_use]
    pub fn clean_intermediates(mut self, clean: bool) -> Self {
        self.clean_intermediates = clean;
        self
    }

    /// Controls skip-on-resume. Enabled by default.
    #[must_use]
    pub fn skip_completed(mut self, skip: bool) -> Self {
        self.skip_completed = skip;
        self
    }

    /// Validates and freezes the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` describing the first invalid setting.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let source = self.resolve_source()?;

        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        if self.transcription.model.trim().is_empty() {
            return Err(ConfigError::EmptyParameter("model"));
        }
        if self.stages.contains(&StageId::Analyze) && self.analysis.template.trim().is_empty() {
            return Err(ConfigError::EmptyParameter("analysis_template"));
        }
        if self.stages.contains(&StageId::Export)
            && self.export.formats.iter().all(|f| f.trim().is_empty())
        {
            return Err(ConfigError::NoExportFormats);
        }
        if self.stages.contains(&StageId::Publish)
            && self
                .publish
                .destination
                .as_deref()
                .map_or(true, |d| d.trim().is_empty())
        {
            return Err(ConfigError::MissingPublishDestination);
        }

        let workdir = self
            .workdir
            .clone()
            .unwrap_or_else(|| derive_workdir(&self.output_root, &source));

        Ok(PipelineConfig {
            source,
            workdir,
            stages: self.stages,
            transcription: self.transcription,
            analysis: self.analysis,
            export: self.export,
            publish: self.publish,
            verbose: self.verbose,
            clean_intermediates: self.clean_intermediates,
            skip_completed: self.skip_completed,
        })
    }

    fn resolve_source(&self) -> Result<SourceSelector, ConfigError> {
        let show = self.show.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let url = self.url.as_deref().map(str::trim).filter(|s| !s.is_empty());

        match (show, url) {
            (None, None) => {
                if self.date.is_some() {
                    return Err(ConfigError::FilterWithoutShow("date"));
                }
                if self.title.is_some() {
                    return Err(ConfigError::FilterWithoutShow("title"));
                }
                Err(ConfigError::MissingSource)
            }
            (Some(show), Some(url)) => Err(ConfigError::ConflictingSources {
                show: show.to_string(),
                url: url.to_string(),
            }),
            (None, Some(url)) => {
                if self.date.is_some() {
                    return Err(ConfigError::FilterWithoutShow("date"));
                }
                if self.title.is_some() {
                    return Err(ConfigError::FilterWithoutShow("title"));
                }
                Ok(SourceSelector::Url(url.to_string()))
            }
            (Some(show), None) => {
                let filter = match (self.date.as_deref(), self.title.as_deref()) {
                    (Some(_), Some(_)) => return Err(ConfigError::ConflictingFilters),
                    (Some(raw), None) => {
                        let date = parse_episode_date(raw).map_err(|e| ConfigError::InvalidDate {
                            value: raw.to_string(),
                            reason: e.to_string(),
                        })?;
                        EpisodeFilter::Date(date)
                    }
                    (None, Some(title)) if !title.trim().is_empty() => {
                        EpisodeFilter::Title(title.trim().to_string())
                    }
                    (None, Some(_)) => return Err(ConfigError::EmptyParameter("title")),
                    (None, None) => EpisodeFilter::Latest,
                };
                Ok(SourceSelector::Show {
                    name: show.to_string(),
                    filter,
                })
            }
        }
    }
}

fn derive_workdir(root: &Path, source: &SourceSelector) -> PathBuf {
    source
        .episode_id()
        .split('/')
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_stages() {
        let config = PipelineConfig::builder().show("Radiolab").build().unwrap();
        let stages: Vec<_> = config.stages().iter().copied().collect();
        assert_eq!(
            stages,
            vec![StageId::Fetch, StageId::Normalize, StageId::Transcribe]
        );
        assert!(config.skip_completed());
    }

    #[test]
    fn test_toggles_add_and_remove() {
        let config = PipelineConfig::builder()
            .show("Radiolab")
            .align(true)
            .diarize(true)
            .analyze(true)
            .diarize(false)
            .build()
            .unwrap();

        assert!(config.requests(StageId::Align));
        assert!(config.requests(StageId::Analyze));
        assert!(!config.requests(StageId::Diarize));
    }

    #[test]
    fn test_missing_source() {
        assert_eq!(
            PipelineConfig::builder().build().unwrap_err(),
            ConfigError::MissingSource
        );
    }

    #[test]
    fn test_conflicting_sources() {
        let err = PipelineConfig::builder()
            .show("Radiolab")
            .url("https://example.com/ep.mp3")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingSources { .. }));
    }

    #[test]
    fn test_filter_requires_show() {
        let err = PipelineConfig::builder()
            .url("https://example.com/ep.mp3")
            .date("2024-01-02")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::FilterWithoutShow("date"));
    }

    #[test]
    fn test_invalid_date() {
        let err = PipelineConfig::builder()
            .show("Radiolab")
            .date("someday")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDate { .. }));
    }

    #[test]
    fn test_publish_requires_destination() {
        let err = PipelineConfig::builder()
            .show("Radiolab")
            .publish(true)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingPublishDestination);
    }

    #[test]
    fn test_empty_stage_set() {
        let err = PipelineConfig::builder()
            .show("Radiolab")
            .stages([])
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::NoStages);
    }

    #[test]
    fn test_stage_names() {
        let builder = PipelineConfig::builder()
            .show("Radiolab")
            .stage_names(["transcribe", "align"])
            .unwrap();
        let config = builder.build().unwrap();
        assert_eq!(config.stages().len(), 2);

        let err = PipelineConfig::builder()
            .stage_names(["transcode"])
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownStage("transcode".to_string()));
    }

    #[test]
    fn test_derived_workdir_for_show_and_date() {
        let config = PipelineConfig::builder()
            .show("This American Life")
            .date("Oct 5, 2023")
            .output_root("/data")
            .build()
            .unwrap();

        assert_eq!(config.workdir(), Path::new("/data/this-american-life/2023-10-05"));
        assert_eq!(config.episode_id(), "this-american-life/2023-10-05");
    }

    #[test]
    fn test_settings_supply_output_root() {
        let settings = EngineSettings::default().with_output_root("/srv/media");
        let config = PipelineConfig::builder_from(&settings)
            .show("Radiolab")
            .date("2024-03-01")
            .build()
            .unwrap();

        assert_eq!(config.workdir(), Path::new("/srv/media/radiolab/2024-03-01"));
    }

    #[test]
    fn test_derived_workdir_for_url() {
        let config = PipelineConfig::builder()
            .url("https://cdn.example.com/shows/Episode_42.mp3?token=abc")
            .output_root("/data")
            .build()
            .unwrap();

        assert_eq!(config.workdir(), Path::new("/data/episode-42"));
    }

    #[test]
    fn test_explicit_workdir_wins() {
        let config = PipelineConfig::builder()
            .show("Radiolab")
            .workdir("/tmp/work")
            .build()
            .unwrap();
        assert_eq!(config.workdir(), Path::new("/tmp/work"));
    }

    #[test]
    fn test_artifact_variant_and_params() {
        let config = PipelineConfig::builder()
            .show("Radiolab")
            .model("large-v3")
            .analysis_template("interview")
            .build()
            .unwrap();

        assert_eq!(config.artifact_variant(StageId::Align).as_deref(), Some("large-v3"));
        assert_eq!(config.artifact_variant(StageId::Analyze).as_deref(), Some("interview"));
        assert_eq!(config.artifact_variant(StageId::Export), None);
        assert_eq!(config.stage_params(StageId::Transcribe)["compute"], "int8");
        assert_eq!(config.stage_params(StageId::Align), config.stage_params(StageId::Transcribe));
        assert_eq!(config.artifact_variants()[StageId::Diarize].as_deref(), Some("large-v3"));
    }
}

//! Sample stage documents and artifact seeding.

use serde_json::{json, Value};
use std::io;
use std::path::{Path, PathBuf};

use crate::artifacts::artifact_path;
use crate::core::StageId;
use crate::executor::UnitRequest;
use crate::utils::atomic_write_json;

fn aligned_segments(speaker: Option<&str>, text: &str) -> Value {
    json!([{
        "start": 0.0,
        "end": 1.2,
        "text": text,
        "speaker": speaker,
        "words": [
            {"word": "hello", "start": 0.0, "end": 0.5, "score": 0.98},
            {"word": "world", "start": 0.6, "end": 1.2, "score": 0.95}
        ]
    }])
}

/// A valid output document for `stage`, shaped by the stage's params.
#[must_use]
pub fn sample_document(stage: StageId, workdir: &Path, params: &Value) -> Value {
    let model = params["model"].as_str().unwrap_or("large-v3");
    match stage {
        StageId::Fetch => json!({
            "show": "Sample Show",
            "title": "Sample Episode",
            "date": "2024-01-15",
            "audio_path": workdir.join("original.mp3"),
        }),
        StageId::Normalize => json!({
            "audio_path": workdir.join("audio.wav"),
            "sample_rate": 16000,
            "channels": 1,
            "duration_seconds": 1.2,
        }),
        StageId::Transcribe => json!({
            "segments": [{"start": 0.0, "end": 1.2, "text": "hello world"}],
            "language": "en",
            "model": model,
        }),
        StageId::Align => json!({
            "segments": aligned_segments(None, "hello world"),
            "language": "en",
            "model": model,
        }),
        StageId::Diarize => json!({
            "segments": aligned_segments(Some("SPEAKER_00"), "hello world"),
            "language": "en",
            "model": model,
        }),
        StageId::Restore => json!({
            "segments": aligned_segments(None, "Hello, world."),
            "language": "en",
            "model": model,
        }),
        StageId::Analyze => json!({
            "template": params["template"].as_str().unwrap_or("general"),
            "markdown": "# Summary\n\nA greeting.",
            "model": params["model"],
        }),
        StageId::Export => {
            let formats: Vec<String> = params["formats"]
                .as_array()
                .map(|f| f.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_else(|| vec!["srt".to_string()]);
            let files: Vec<PathBuf> = formats
                .iter()
                .map(|f| workdir.join(format!("transcript.{f}")))
                .collect();
            json!({ "files": files, "formats": formats })
        }
        StageId::Publish => {
            let destination = params["destination"].as_str().unwrap_or("local");
            json!({
                "destination": destination,
                "url": format!("https://{destination}/sample-episode"),
            })
        }
    }
}

/// The document a well-behaved unit would answer `request` with.
#[must_use]
pub fn sample_output(request: &UnitRequest) -> Value {
    sample_document(request.stage, &request.workdir, &request.params)
}

/// Writes `document` as the artifact of `stage`, returning its path.
pub fn write_artifact(
    workdir: &Path,
    stage: StageId,
    variant: Option<&str>,
    document: &Value,
) -> io::Result<PathBuf> {
    let path = artifact_path(workdir, stage, variant);
    atomic_write_json(&path, document)?;
    Ok(path)
}

/// Seeds `workdir` with a sample artifact for `stage`.
pub fn seed_artifact(workdir: &Path, stage: StageId, variant: Option<&str>) -> io::Result<PathBuf> {
    let params = match variant {
        Some(v) if stage == StageId::Analyze => json!({ "template": v }),
        Some(v) => json!({ "model": v }),
        None => json!({}),
    };
    write_artifact(workdir, stage, variant, &sample_document(stage, workdir, &params))
}

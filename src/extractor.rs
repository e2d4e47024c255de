use std::{io::ErrorKind, path::PathBuf, process::Output};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("yt-dlp is not installed or not on PATH")]
    NotInstalled,
    #[error("could not run yt-dlp: {0}")]
    Spawn(std::io::Error),
    #[error("yt-dlp did not finish within {0} seconds")]
    TimedOut(u64),
    #[error("{message}")]
    Failed { message: String, stderr: String },
    #[error("could not parse yt-dlp metadata: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

impl ExtractError {
    /// Failure built from yt-dlp's stderr; the last non-empty line becomes
    /// the message and the whole text is kept for classification.
    pub fn from_stderr(stderr: String, fallback: impl FnOnce() -> String) -> Self {
        let message = stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .map(ToString::to_string)
            .unwrap_or_else(fallback);

        Self::Failed { message, stderr }
    }

    /// Everything yt-dlp reported, not only the line shown to clients.
    pub fn diagnostics(&self) -> String {
        match self {
            Self::Failed { stderr, .. } if !stderr.trim().is_empty() => stderr.clone(),
            _ => self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaType {
    #[default]
    Video,
    Audio,
}

impl MediaType {
    /// Anything other than `audio` downloads the rendition as-is.
    pub fn from_form(value: Option<&str>) -> Self {
        match value {
            Some("audio") => Self::Audio,
            _ => Self::Video,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaterializeOptions {
    pub format_id: String,
    pub output_template: String,
    pub media_type: MediaType,
}

/// Keeps an explicit JSON `null` as `Some(Value::Null)` so it survives the
/// projection; a missing key stays `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
pub struct RawMediaInfo {
    #[serde(default, deserialize_with = "present")]
    pub id: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub title: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub thumbnail: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub duration: Option<Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub formats: Vec<RawFormat>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<RawFormat>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<RawFormat>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Default, Deserialize)]
pub struct RawFormat {
    #[serde(default, deserialize_with = "present")]
    pub url: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub format_id: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub ext: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub format_note: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub height: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub width: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub filesize: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub fps: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub tbr: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub acodec: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub vcodec: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub asr: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub abr: Option<Value>,
}

impl RawFormat {
    fn has_playable_url(&self) -> bool {
        self.url.as_ref().is_some_and(is_truthy)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Serialize)]
pub struct FormatOption {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_note: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tbr: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abr: Option<Value>,
}

impl From<RawFormat> for FormatOption {
    fn from(raw: RawFormat) -> Self {
        Self {
            format_id: raw.format_id,
            ext: raw.ext,
            format_note: raw.format_note,
            height: raw.height,
            width: raw.width,
            filesize: raw.filesize,
            fps: raw.fps,
            tbr: raw.tbr,
            acodec: raw.acodec,
            vcodec: raw.vcodec,
            asr: raw.asr,
            abr: raw.abr,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MediaDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Value>,
    pub formats: Vec<FormatOption>,
}

impl From<RawMediaInfo> for MediaDescriptor {
    fn from(info: RawMediaInfo) -> Self {
        Self {
            id: info.id,
            title: info.title,
            thumbnail: info.thumbnail,
            duration: info.duration,
            formats: info
                .formats
                .into_iter()
                .filter(RawFormat::has_playable_url)
                .map(FormatOption::from)
                .collect(),
        }
    }
}

/// The external media-extraction capability.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Fetch metadata and the list of renditions without downloading.
    async fn describe(&self, url: &str) -> Result<RawMediaInfo, ExtractError>;

    /// Write exactly one file for `url` according to `options`. Success is
    /// judged by the caller from the output directory contents.
    async fn materialize(&self, url: &str, options: &MaterializeOptions)
    -> Result<(), ExtractError>;
}

pub struct YtDlp {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, ExtractError> {
        debug!("Running {:?} {:?}", self.binary, args);
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        let result = match self.timeout {
            Some(limit) => timeout(limit, command_future)
                .await
                .map_err(|_| ExtractError::TimedOut(limit.as_secs()))?,
            None => command_future.await,
        };

        let output = result.map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ExtractError::NotInstalled
            } else {
                ExtractError::Spawn(error)
            }
        })?;

        if !output.status.success() {
            return Err(ExtractError::from_stderr(
                String::from_utf8_lossy(&output.stderr).into_owned(),
                || format!("yt-dlp exited with {}", output.status),
            ));
        }

        Ok(output)
    }

    /// Logs the versions of yt-dlp and ffmpeg found on the host.
    pub async fn log_availability(&self) {
        match Command::new(&self.binary).arg("--version").output().await {
            Ok(output) if output.status.success() => info!(
                "yt-dlp available, version {}",
                String::from_utf8_lossy(&output.stdout).trim()
            ),
            Ok(output) => warn!("yt-dlp --version exited with {}", output.status),
            Err(error) => warn!("yt-dlp not found at {:?}: {error}", self.binary),
        }

        match Command::new("ffmpeg").arg("-version").output().await {
            Ok(output) if output.status.success() => info!(
                "ffmpeg available: {}",
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .unwrap_or("unknown")
            ),
            _ => warn!("ffmpeg not found; audio downloads will fail to transcode"),
        }
    }
}

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn describe(&self, url: &str) -> Result<RawMediaInfo, ExtractError> {
        let output = self.run(describe_args(url)).await?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn materialize(
        &self,
        url: &str,
        options: &MaterializeOptions,
    ) -> Result<(), ExtractError> {
        self.run(materialize_args(url, options)).await.map(|_| ())
    }
}

pub fn describe_args(url: &str) -> Vec<String> {
    vec![
        "--dump-single-json".to_string(),
        "--skip-download".to_string(),
        "--quiet".to_string(),
        "--no-warnings".to_string(),
        url.to_string(),
    ]
}

pub fn materialize_args(url: &str, options: &MaterializeOptions) -> Vec<String> {
    let mut args = vec![
        "-f".to_string(),
        options.format_id.clone(),
        "-o".to_string(),
        options.output_template.clone(),
        "--quiet".to_string(),
        "--no-playlist".to_string(),
    ];

    if options.media_type == MediaType::Audio {
        args.extend(
            [
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
                "--prefer-ffmpeg",
            ]
            .map(ToString::to_string),
        );
    }

    args.push(url.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(media_type: MediaType) -> MaterializeOptions {
        MaterializeOptions {
            format_id: "18".to_string(),
            output_template: "/tmp/yt-dlp-x/%(title)s.%(ext)s".to_string(),
            media_type,
        }
    }

    #[test]
    fn describe_args_request_single_json_without_download() {
        assert_eq!(
            describe_args("https://example.com/v/abc"),
            vec![
                "--dump-single-json",
                "--skip-download",
                "--quiet",
                "--no-warnings",
                "https://example.com/v/abc",
            ]
        );
    }

    #[test]
    fn video_materialize_args() {
        let args = materialize_args("https://example.com/v/abc", &options(MediaType::Video));
        assert_eq!(
            args,
            vec![
                "-f",
                "18",
                "-o",
                "/tmp/yt-dlp-x/%(title)s.%(ext)s",
                "--quiet",
                "--no-playlist",
                "https://example.com/v/abc",
            ]
        );
    }

    #[test]
    fn audio_materialize_args_transcode_to_mp3() {
        let args = materialize_args("https://example.com/v/abc", &options(MediaType::Audio));
        let joined = args.join(" ");
        assert!(joined.contains("--no-playlist"));
        assert!(joined.contains("--extract-audio --audio-format mp3 --audio-quality 192K"));
        assert!(joined.contains("--prefer-ffmpeg"));
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/v/abc"));
    }

    #[test]
    fn media_type_defaults_to_video() {
        assert_eq!(MediaType::from_form(None), MediaType::Video);
        assert_eq!(MediaType::from_form(Some("video")), MediaType::Video);
        assert_eq!(MediaType::from_form(Some("AUDIO")), MediaType::Video);
        assert_eq!(MediaType::from_form(Some("audio")), MediaType::Audio);
    }

    #[test]
    fn projection_keeps_only_formats_with_url_in_order() {
        let raw: RawMediaInfo = serde_json::from_value(json!({
            "id": "abc",
            "title": "T",
            "formats": [
                {"format_id": "18", "url": "https://cdn/18", "ext": "mp4"},
                {"format_id": "none", "url": null},
                {"format_id": "sb0"},
                {"format_id": "22", "url": "https://cdn/22", "ext": "mp4", "height": null},
                {"format_id": "empty", "url": ""}
            ]
        }))
        .unwrap();

        let descriptor = MediaDescriptor::from(raw);
        let body = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(
            body,
            json!({
                "id": "abc",
                "title": "T",
                "formats": [
                    {"format_id": "18", "ext": "mp4"},
                    {"format_id": "22", "ext": "mp4", "height": null}
                ]
            })
        );
    }

    #[test]
    fn projection_copies_all_format_fields() {
        let raw: RawMediaInfo = serde_json::from_value(json!({
            "id": "x",
            "title": "Clip",
            "thumbnail": "https://img/x.jpg",
            "duration": 12.5,
            "formats": [{
                "url": "u", "format_id": "140", "ext": "m4a", "format_note": "medium",
                "height": null, "width": null, "filesize": 1024, "fps": null,
                "tbr": 129.5, "acodec": "mp4a.40.2", "vcodec": "none",
                "asr": 44100, "abr": 129.5, "protocol": "https"
            }]
        }))
        .unwrap();

        let body = serde_json::to_value(MediaDescriptor::from(raw)).unwrap();
        assert_eq!(body["thumbnail"], "https://img/x.jpg");
        assert_eq!(body["duration"], 12.5);
        assert_eq!(
            body["formats"][0],
            json!({
                "format_id": "140", "ext": "m4a", "format_note": "medium",
                "height": null, "width": null, "filesize": 1024, "fps": null,
                "tbr": 129.5, "acodec": "mp4a.40.2", "vcodec": "none",
                "asr": 44100, "abr": 129.5
            })
        );
    }

    #[test]
    fn missing_or_null_formats_yield_empty_list() {
        let missing: RawMediaInfo = serde_json::from_value(json!({"id": "a"})).unwrap();
        assert!(missing.formats.is_empty());

        let null: RawMediaInfo =
            serde_json::from_value(json!({"id": "a", "formats": null})).unwrap();
        assert!(null.formats.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_reports_not_installed() {
        let extractor = YtDlp::new("/nonexistent/yt-dlp-binary", Some(Duration::from_secs(5)));
        let error = extractor.describe("https://example.com").await.unwrap_err();
        assert!(matches!(error, ExtractError::NotInstalled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_without_stderr_reports_status() {
        let extractor = YtDlp::new("false", Some(Duration::from_secs(10)));
        let error = extractor
            .materialize("https://example.com", &options(MediaType::Video))
            .await
            .unwrap_err();

        assert!(matches!(error, ExtractError::Failed { .. }));
        assert!(error.to_string().starts_with("yt-dlp exited with"));
    }

    #[test]
    fn failure_message_is_last_stderr_line_but_diagnostics_keep_everything() {
        let stderr = "ERROR: [youtube] abc: HTTP Error 403: Forbidden\n\
                      ERROR: fragment 1 not found, unable to continue\n\n";
        let error = ExtractError::from_stderr(stderr.to_string(), || "fallback".to_string());

        assert_eq!(
            error.to_string(),
            "ERROR: fragment 1 not found, unable to continue"
        );
        assert!(error.diagnostics().contains("HTTP Error 403"));
    }

    #[test]
    fn empty_stderr_uses_fallback_message() {
        let error = ExtractError::from_stderr("  \n".to_string(), || "yt-dlp exited with 1".to_string());
        assert_eq!(error.to_string(), "yt-dlp exited with 1");
        assert_eq!(error.diagnostics(), "yt-dlp exited with 1");
    }
}

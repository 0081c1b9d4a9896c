use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use studio_contracts::events::{EventPayload, EventWriter};
use studio_contracts::history::{short_token, EncodedImage, GenerationRecord, HistoryStore};
use studio_contracts::session::{SessionError, SessionPhase};

pub const DEFAULT_INSTRUCTION: &str = "Recreate this image with professional studio lighting";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

const REQUEST_TIMEOUT_S: u64 = 90;
const DRYRUN_EDGE: u32 = 256;

/// One submission to the external edit capability. Constructed at
/// submission time and discarded as soon as the call resolves.
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub image: EncodedImage,
    pub instruction: String,
}

pub trait ImageEditProvider: Send + Sync {
    fn name(&self) -> &str;
    fn edit(&self, request: &EditRequest) -> Result<EncodedImage>;
}

/// Picks the provider implied by a model name. Anything starting with
/// `dryrun` runs offline; everything else goes to Gemini.
pub fn provider_for_model(model: &str) -> Box<dyn ImageEditProvider> {
    if model.trim().to_ascii_lowercase().starts_with("dryrun") {
        Box::new(DryrunProvider)
    } else {
        Box::new(GeminiProvider::new(model))
    }
}

struct DryrunProvider;

impl ImageEditProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn edit(&self, request: &EditRequest) -> Result<EncodedImage> {
        let (r, g, b) = color_from_instruction(&request.instruction);
        let mut canvas = RgbImage::new(DRYRUN_EDGE, DRYRUN_EDGE);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut cursor, ImageFormat::Png)
            .context("dryrun image encode failed")?;
        Ok(EncodedImage::from_bytes(cursor.get_ref(), "image/png"))
    }
}

struct GeminiProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl GeminiProvider {
    fn new(model: &str) -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            model: model.trim().to_string(),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint(&self) -> String {
        let model_path = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn extract_first_image(response_payload: &Value) -> Result<EncodedImage> {
        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                BASE64
                    .decode(data.as_bytes())
                    .context("Gemini image base64 decode failed")?;
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                return Ok(EncodedImage {
                    mime_type: mime_type.to_string(),
                    data: data.to_string(),
                });
            }
        }

        bail!("Gemini returned no image")
    }
}

impl ImageEditProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn edit(&self, request: &EditRequest) -> Result<EncodedImage> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint();
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": request.image.mime_type,
                            "data": request.image.data,
                        }
                    },
                    { "text": request.instruction },
                ],
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        Self::extract_first_image(&response_payload)
    }
}

/// Scoped on-disk preview for the current selection. The file is removed
/// when the handle is dropped, so replacing or clearing a selection
/// releases the previous preview deterministically.
#[derive(Debug)]
pub struct PreviewHandle {
    path: PathBuf,
}

impl PreviewHandle {
    fn create(session_dir: &Path, bytes: &[u8], mime_type: &str) -> Result<Self> {
        fs::create_dir_all(session_dir)
            .with_context(|| format!("failed to create {}", session_dir.display()))?;
        let path = session_dir.join(format!(
            "preview-{}.{}",
            short_token(),
            extension_for_mime(mime_type)
        ));
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug)]
struct SelectedImage {
    bytes: Vec<u8>,
    mime_type: String,
    preview: PreviewHandle,
}

/// Owns the whole generation session: the current selection, the
/// instruction text, the lifecycle phase, the last surfaced error, and
/// the in-memory history. Every mutation goes through the methods below
/// and lands one line in the session event stream.
pub struct SessionController {
    session_dir: PathBuf,
    events: EventWriter,
    provider: Box<dyn ImageEditProvider>,
    selected: Option<SelectedImage>,
    instruction: String,
    phase: SessionPhase,
    error: Option<String>,
    history: HistoryStore,
}

impl SessionController {
    pub fn new(
        session_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        model: Option<String>,
    ) -> Result<Self> {
        let model = model
            .or_else(|| non_empty_env("STUDIO_IMAGE_MODEL"))
            .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());
        Self::with_provider(session_dir, events_path, provider_for_model(&model))
    }

    pub fn with_provider(
        session_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        provider: Box<dyn ImageEditProvider>,
    ) -> Result<Self> {
        let session_dir = session_dir.into();
        fs::create_dir_all(&session_dir)
            .with_context(|| format!("failed to create {}", session_dir.display()))?;
        let events = EventWriter::new(events_path.into(), format!("session-{}", short_token()));
        Ok(Self {
            session_dir,
            events,
            provider,
            selected: None,
            instruction: DEFAULT_INSTRUCTION.to_string(),
            phase: SessionPhase::Idle,
            error: None,
            history: HistoryStore::new(),
        })
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn has_selection(&self) -> bool {
        self.selected.is_some()
    }

    pub fn preview_path(&self) -> Option<&Path> {
        self.selected
            .as_ref()
            .map(|selected| selected.preview.path())
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// Replaces the current selection with the file at `path`. The bytes
    /// are taken as-is; MIME is inferred from the extension only, never
    /// content-sniffed. A prior error and a settled phase are both reset.
    pub fn select_image(&mut self, path: &Path) -> Result<()> {
        let bytes =
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime_type = mime_for_path(path).unwrap_or("image/png").to_string();
        let preview = PreviewHandle::create(&self.session_dir, &bytes, &mime_type)?;
        let preview_path = preview.path().to_string_lossy().to_string();
        let byte_count = bytes.len();
        self.selected = Some(SelectedImage {
            bytes,
            mime_type: mime_type.clone(),
            preview,
        });
        self.error = None;
        if matches!(self.phase, SessionPhase::Succeeded | SessionPhase::Failed) {
            self.phase = SessionPhase::Idle;
        }
        self.events.emit(
            "image_selected",
            map_object(json!({
                "source": path.to_string_lossy(),
                "mime_type": mime_type,
                "bytes": byte_count,
                "preview": preview_path,
            })),
        )?;
        Ok(())
    }

    pub fn update_instruction(&mut self, text: impl Into<String>) {
        self.instruction = text.into();
    }

    /// Discards the selection (releasing its preview), restores the
    /// default instruction, and returns the phase to idle. History and
    /// the last error are untouched.
    pub fn clear_selection(&mut self) -> Result<()> {
        self.selected = None;
        self.instruction = DEFAULT_INSTRUCTION.to_string();
        self.phase = SessionPhase::Idle;
        self.events.emit("selection_cleared", EventPayload::new())?;
        Ok(())
    }

    /// Runs one generation against the configured provider.
    ///
    /// Either exactly one record is prepended to the history and the phase
    /// becomes `succeeded`, or the history is untouched and the phase
    /// becomes `failed` with the error message surfaced; there is no
    /// partial mutation. Without a selection the call is rejected before
    /// the provider is reached and the phase keeps its current value.
    /// A call while another is in flight is rejected outright.
    pub fn generate(&mut self) -> Result<GenerationRecord> {
        let Some(selected) = self.selected.as_ref() else {
            let err = SessionError::NoImageSelected;
            self.error = Some(err.to_string());
            return Err(err.into());
        };
        if self.phase == SessionPhase::Generating {
            return Err(SessionError::generation("a generation is already in progress").into());
        }

        let original = EncodedImage::from_bytes(&selected.bytes, selected.mime_type.as_str());
        let instruction = self.instruction.clone();
        self.phase = SessionPhase::Generating;
        self.error = None;
        self.events.emit(
            "generation_started",
            map_object(json!({
                "provider": self.provider.name(),
                "mime_type": original.mime_type,
                "instruction": instruction,
            })),
        )?;

        let request = EditRequest {
            image: original.clone(),
            instruction: instruction.clone(),
        };
        match self.provider.edit(&request) {
            Ok(generated) if !generated.is_empty() => {
                let record = GenerationRecord::new(original, generated, instruction);
                self.history.prepend(record.clone());
                self.phase = SessionPhase::Succeeded;
                self.events.emit(
                    "generation_succeeded",
                    map_object(json!({
                        "record_id": record.id,
                        "provider": self.provider.name(),
                    })),
                )?;
                Ok(record)
            }
            Ok(_) => self.fail_generation("Failed to generate image."),
            Err(err) => {
                let mut message = error_chain_text(&err, 512);
                if message.trim().is_empty() {
                    message = "An unexpected error occurred.".to_string();
                }
                self.fail_generation(&message)
            }
        }
    }

    /// Removes one record by id. Idempotent; the phase is never altered.
    pub fn delete_record(&mut self, id: &str) -> Result<bool> {
        let removed = self.history.remove(id);
        if removed {
            self.events.emit(
                "record_deleted",
                map_object(json!({ "record_id": id })),
            )?;
        }
        Ok(removed)
    }

    pub fn clear_history(&mut self) -> Result<()> {
        self.history.clear();
        self.events.emit("history_cleared", EventPayload::new())?;
        Ok(())
    }

    /// The download action: decodes a record's generated image into
    /// `<out_dir>/clone-<id>.<ext>` and returns the written path.
    pub fn export_record(&self, id: &str, out_dir: &Path) -> Result<PathBuf> {
        let record = self
            .history
            .get(id)
            .with_context(|| format!("no record with id '{id}'"))?;
        let bytes = record.generated.decode()?;
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let path = out_dir.join(record.export_filename());
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        self.events.emit(
            "record_exported",
            map_object(json!({
                "record_id": id,
                "path": path.to_string_lossy(),
            })),
        )?;
        Ok(path)
    }

    fn fail_generation(&mut self, message: &str) -> Result<GenerationRecord> {
        self.phase = SessionPhase::Failed;
        self.error = Some(message.to_string());
        self.events.emit(
            "generation_failed",
            map_object(json!({ "error": message })),
        )?;
        Err(SessionError::generation(message).into())
    }
}

fn color_from_instruction(instruction: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(instruction.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    let lowered = mime_type.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    "png"
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::bail;
    use serde_json::Value;
    use studio_contracts::history::EncodedImage;
    use studio_contracts::session::SessionPhase;

    use super::{
        mime_for_path, DryrunProvider, EditRequest, ImageEditProvider, SessionController,
        DEFAULT_INSTRUCTION,
    };

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
    }

    impl ImageEditProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        fn edit(&self, request: &EditRequest) -> anyhow::Result<EncodedImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(EncodedImage::from_bytes(
                format!("edited:{}", request.instruction).as_bytes(),
                "image/png",
            ))
        }
    }

    struct EmptyProvider;

    impl ImageEditProvider for EmptyProvider {
        fn name(&self) -> &str {
            "empty"
        }

        fn edit(&self, _request: &EditRequest) -> anyhow::Result<EncodedImage> {
            Ok(EncodedImage {
                mime_type: "image/png".to_string(),
                data: String::new(),
            })
        }
    }

    struct FailingProvider {
        message: &'static str,
    }

    impl ImageEditProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        fn edit(&self, _request: &EditRequest) -> anyhow::Result<EncodedImage> {
            bail!("{}", self.message)
        }
    }

    fn write_source(dir: &Path, name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = dir.join(name);
        fs::write(&path, bytes)?;
        Ok(path)
    }

    fn controller_with(
        temp: &Path,
        provider: Box<dyn ImageEditProvider>,
    ) -> anyhow::Result<SessionController> {
        let session_dir = temp.join("session");
        let events_path = session_dir.join("events.jsonl");
        SessionController::with_provider(session_dir, events_path, provider)
    }

    fn event_types(controller: &SessionController) -> anyhow::Result<Vec<String>> {
        let raw = fs::read_to_string(controller.event_writer().path())?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    #[test]
    fn generate_appends_one_record_and_succeeds() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "source.png", b"source-pixels")?;
        let mut controller = controller_with(temp.path(), Box::new(DryrunProvider))?;

        controller.select_image(&source)?;
        controller.update_instruction("add rain");
        let record = controller.generate()?;

        assert_eq!(controller.phase(), SessionPhase::Succeeded);
        assert_eq!(controller.error(), None);
        assert_eq!(controller.history().len(), 1);
        assert_eq!(controller.history().records()[0].id, record.id);
        assert_eq!(record.prompt, "add rain");
        assert_eq!(record.original.decode()?, b"source-pixels");
        assert!(!record.generated.is_empty());
        assert!(record.timestamp_ms > 0);
        Ok(())
    }

    #[test]
    fn history_is_strictly_newest_first() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = write_source(temp.path(), "a.png", b"image-a")?;
        let second = write_source(temp.path(), "c.png", b"image-c")?;
        let mut controller = controller_with(temp.path(), Box::new(DryrunProvider))?;

        controller.select_image(&first)?;
        controller.update_instruction("first pass");
        let record_a = controller.generate()?;

        controller.select_image(&second)?;
        controller.update_instruction("second pass");
        let record_c = controller.generate()?;

        let records = controller.history().records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, record_c.id);
        assert_eq!(records[0].original.decode()?, b"image-c");
        assert_eq!(records[1].id, record_a.id);
        assert_eq!(records[1].original.decode()?, b"image-a");
        Ok(())
    }

    #[test]
    fn generate_without_selection_never_reaches_provider() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut controller = controller_with(
            temp.path(),
            Box::new(CountingProvider {
                calls: calls.clone(),
            }),
        )?;

        let err = controller.generate().unwrap_err();
        assert_eq!(err.to_string(), "Please select an image first.");
        assert_eq!(controller.error(), Some("Please select an image first."));
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert!(controller.history().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn provider_failure_surfaces_message_without_touching_history() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "a.png", b"image-a")?;
        let mut controller = controller_with(
            temp.path(),
            Box::new(FailingProvider {
                message: "quota exceeded",
            }),
        )?;

        controller.select_image(&source)?;
        let err = controller.generate().unwrap_err();

        assert_eq!(err.to_string(), "quota exceeded");
        assert_eq!(controller.phase(), SessionPhase::Failed);
        assert_eq!(controller.error(), Some("quota exceeded"));
        assert!(controller.history().is_empty());
        Ok(())
    }

    #[test]
    fn empty_provider_result_counts_as_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "a.png", b"image-a")?;
        let mut controller = controller_with(temp.path(), Box::new(EmptyProvider))?;

        controller.select_image(&source)?;
        assert!(controller.generate().is_err());

        assert_eq!(controller.phase(), SessionPhase::Failed);
        assert_eq!(controller.error(), Some("Failed to generate image."));
        assert!(controller.history().is_empty());
        Ok(())
    }

    #[test]
    fn selecting_a_new_image_clears_a_failed_phase_and_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "a.png", b"image-a")?;
        let mut controller = controller_with(
            temp.path(),
            Box::new(FailingProvider { message: "boom" }),
        )?;

        controller.select_image(&source)?;
        assert!(controller.generate().is_err());
        assert_eq!(controller.phase(), SessionPhase::Failed);
        assert_eq!(controller.error(), Some("boom"));

        controller.select_image(&source)?;
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert_eq!(controller.error(), None);
        Ok(())
    }

    #[test]
    fn delete_record_is_idempotent_and_keeps_phase() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "a.png", b"image-a")?;
        let mut controller = controller_with(temp.path(), Box::new(DryrunProvider))?;

        controller.select_image(&source)?;
        let first = controller.generate()?;
        let second = controller.generate()?;

        assert!(controller.delete_record(&second.id)?);
        assert!(!controller.delete_record(&second.id)?);
        assert!(!controller.delete_record("missing")?);
        assert_eq!(controller.history().len(), 1);
        assert_eq!(controller.history().records()[0].id, first.id);
        assert_eq!(controller.phase(), SessionPhase::Succeeded);
        Ok(())
    }

    #[test]
    fn clear_history_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "a.png", b"image-a")?;
        let mut controller = controller_with(temp.path(), Box::new(DryrunProvider))?;

        controller.select_image(&source)?;
        controller.generate()?;
        controller.clear_history()?;
        assert!(controller.history().is_empty());
        controller.clear_history()?;
        assert!(controller.history().is_empty());
        Ok(())
    }

    #[test]
    fn clear_selection_resets_instruction_and_phase() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "a.png", b"image-a")?;
        let mut controller = controller_with(temp.path(), Box::new(DryrunProvider))?;

        controller.select_image(&source)?;
        controller.update_instruction("make it snow");
        controller.generate()?;
        assert_eq!(controller.phase(), SessionPhase::Succeeded);

        controller.clear_selection()?;
        assert!(!controller.has_selection());
        assert_eq!(controller.instruction(), DEFAULT_INSTRUCTION);
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert_eq!(controller.history().len(), 1);
        Ok(())
    }

    #[test]
    fn preview_files_are_released_on_replace_and_clear() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = write_source(temp.path(), "a.png", b"image-a")?;
        let second = write_source(temp.path(), "b.jpg", b"image-b")?;
        let mut controller = controller_with(temp.path(), Box::new(DryrunProvider))?;

        controller.select_image(&first)?;
        let first_preview = controller.preview_path().map(Path::to_path_buf).unwrap();
        assert!(first_preview.exists());

        controller.select_image(&second)?;
        let second_preview = controller.preview_path().map(Path::to_path_buf).unwrap();
        assert!(!first_preview.exists());
        assert!(second_preview.exists());
        assert_eq!(second_preview.extension().and_then(|e| e.to_str()), Some("jpg"));

        controller.clear_selection()?;
        assert!(!second_preview.exists());
        assert_eq!(controller.preview_path(), None);
        Ok(())
    }

    #[test]
    fn export_writes_clone_named_artifact() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "a.png", b"image-a")?;
        let mut controller = controller_with(temp.path(), Box::new(DryrunProvider))?;

        controller.select_image(&source)?;
        let record = controller.generate()?;

        let out_dir = temp.path().join("exports");
        let path = controller.export_record(&record.id, &out_dir)?;
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some(format!("clone-{}.png", record.id).as_str())
        );
        assert_eq!(fs::read(&path)?, record.generated.decode()?);

        assert!(controller
            .export_record("missing", &out_dir)
            .is_err());
        Ok(())
    }

    #[test]
    fn session_events_trace_the_lifecycle() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "a.png", b"image-a")?;
        let mut controller = controller_with(temp.path(), Box::new(DryrunProvider))?;

        controller.select_image(&source)?;
        let record = controller.generate()?;
        controller.delete_record(&record.id)?;
        controller.clear_history()?;
        controller.clear_selection()?;

        let types = event_types(&controller)?;
        assert!(types.contains(&"image_selected".to_string()));
        assert!(types.contains(&"generation_started".to_string()));
        assert!(types.contains(&"generation_succeeded".to_string()));
        assert!(types.contains(&"record_deleted".to_string()));
        assert!(types.contains(&"history_cleared".to_string()));
        assert!(types.contains(&"selection_cleared".to_string()));

        let started_idx = types
            .iter()
            .position(|value| value == "generation_started")
            .expect("missing generation_started");
        let succeeded_idx = types
            .iter()
            .position(|value| value == "generation_succeeded")
            .expect("missing generation_succeeded");
        assert!(started_idx < succeeded_idx);
        Ok(())
    }

    #[test]
    fn failed_generation_emits_failure_event_only() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), "a.png", b"image-a")?;
        let mut controller = controller_with(
            temp.path(),
            Box::new(FailingProvider { message: "boom" }),
        )?;

        controller.select_image(&source)?;
        assert!(controller.generate().is_err());

        let types = event_types(&controller)?;
        assert!(types.contains(&"generation_failed".to_string()));
        assert!(!types.contains(&"generation_succeeded".to_string()));
        Ok(())
    }

    #[test]
    fn dryrun_output_is_a_decodable_png() -> anyhow::Result<()> {
        let request = EditRequest {
            image: EncodedImage::from_bytes(b"anything", "image/png"),
            instruction: "add rain".to_string(),
        };
        let generated = DryrunProvider.edit(&request)?;
        assert_eq!(generated.mime_type, "image/png");
        let decoded = image::load_from_memory(&generated.decode()?)?;
        assert_eq!(decoded.width(), super::DRYRUN_EDGE);
        assert_eq!(decoded.height(), super::DRYRUN_EDGE);

        // Deterministic per instruction.
        let again = DryrunProvider.edit(&request)?;
        assert_eq!(generated, again);
        Ok(())
    }

    #[test]
    fn mime_inference_follows_extension_only() {
        assert_eq!(mime_for_path(Path::new("a.png")), Some("image/png"));
        assert_eq!(mime_for_path(Path::new("a.JPG")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("a.jpeg")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("a.webp")), Some("image/webp"));
        assert_eq!(mime_for_path(Path::new("a.txt")), None);
        assert_eq!(mime_for_path(Path::new("noext")), None);
    }
}

//! Integration tests for mdforge.
//!
//! Each test gets its own `tempfile` root so conversions never see each
//! other's workspaces. No network access is needed.

use async_trait::async_trait;
use mdforge::pipeline::progress::SegmentProgressMiddleware;
use mdforge::pipeline::{artifacts::ArtifactPersistenceMiddleware, postprocess::MarkdownCleanupMiddleware};
use mdforge::{
    compose, derive_title, diagnostics, ArtifactStorage, ArtifactStorageOptions, CancellationToken,
    ConversionConfig, ConversionMiddleware, ConverterRegistry, DocumentConverter, DocumentSegment,
    DocumentStream, ExtractedDocument, ImageArtifact, MarkdownEngine, MaterializeOptions,
    MaterializedSource, Materializer, MdForgeError, MemoryStorage, PipelineContext,
    ProgressDetailLevel, RecordingProgressSink, SegmentKind, SegmentOptions, SharedMiddleware,
    StorageError, StorageFactory, StreamInfo,
};
use mdforge::workspace::SharedStorage;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── Test helpers ─────────────────────────────────────────────────────────────

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

fn entries(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(_) => Vec::new(),
    }
}

fn config(root: &Path) -> mdforge::ConversionConfigBuilder {
    ConversionConfig::builder().workspace_root(root)
}

fn write_input(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Emits the three-segment fixture: Image (with a comment block), Page, Table.
struct FixtureConverter;

#[async_trait]
impl DocumentConverter for FixtureConverter {
    fn name(&self) -> &str {
        "fixture"
    }

    fn priority(&self) -> i32 {
        -10
    }

    fn accepts_input(&self, info: &StreamInfo) -> bool {
        info.normalized_extension().as_deref() == Some(".fixture")
    }

    async fn convert(
        &self,
        _source: &MaterializedSource,
        _info: &StreamInfo,
        _cancel: &CancellationToken,
    ) -> Result<ExtractedDocument, MdForgeError> {
        let mut doc = ExtractedDocument {
            segments: vec![
                DocumentSegment::new(
                    SegmentKind::Image,
                    "<!-- Image description:\n# Fake Heading From Caption\n-->",
                )
                .with_number(1),
                DocumentSegment::new(SegmentKind::Page, "# Actual Title\nBody").with_number(1),
                DocumentSegment::new(SegmentKind::Table, "| a | b |\n|---|---|\n| 1 | 2 |")
                    .with_number(1),
            ],
            ..ExtractedDocument::default()
        };
        doc.artifacts.images = vec![ImageArtifact::new(PNG_MAGIC.to_vec())
            .with_label("chart")
            .with_segment_index(0)];
        Ok(doc)
    }
}

fn memory_factory(storage: Arc<MemoryStorage>) -> StorageFactory {
    Arc::new(move |_info: &StreamInfo| -> Result<SharedStorage, StorageError> {
        Ok(storage.clone())
    })
}

fn fixture_engine(config: ConversionConfig) -> MarkdownEngine {
    let mut registry = ConverterRegistry::with_defaults();
    registry.register(Arc::new(FixtureConverter));
    MarkdownEngine::with_registry(config, registry)
}

/// Appends one Page segment, to prove composition happens after middleware.
struct AppendSegment;

#[async_trait]
impl ConversionMiddleware for AppendSegment {
    fn name(&self) -> &str {
        "append-segment"
    }

    async fn invoke(
        &self,
        ctx: &mut PipelineContext,
        _cancel: &CancellationToken,
    ) -> Result<(), MdForgeError> {
        ctx.segments
            .push(DocumentSegment::new(SegmentKind::Page, "Appended by middleware").with_number(99));
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl ConversionMiddleware for AlwaysFails {
    fn name(&self) -> &str {
        "always-fails"
    }

    async fn invoke(
        &self,
        _ctx: &mut PipelineContext,
        _cancel: &CancellationToken,
    ) -> Result<(), MdForgeError> {
        Err(MdForgeError::Provider {
            provider: "test".into(),
            message: "service unavailable".into(),
        })
    }
}

// ── Plain-text conversion ────────────────────────────────────────────────────

#[tokio::test]
async fn markdown_file_converts_in_place() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = write_input(
        input_dir.path(),
        "notes.md",
        "# Intro\r\nHello   \n\n\n\n\nworld\n# Usage\nRun it.\n",
    );

    let engine = MarkdownEngine::new(
        config(root.path())
            .middleware(Arc::new(MarkdownCleanupMiddleware))
            .build()
            .unwrap(),
    );
    let result = engine
        .convert_path(&input, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.markdown, "# Intro\nHello\n\n\nworld\n\n# Usage\nRun it.");
    assert_eq!(result.title.as_deref(), Some("Intro"));
    assert_eq!(result.stats.converter, "plain-text");
    assert_eq!(result.count(SegmentKind::Section), 2);
    assert!(!result.stats.source_copied, "existing files are read in place");
    assert!(input.exists(), "the caller's file is never removed");
    assert!(!result.workspace.directory.exists());
    assert!(entries(root.path()).is_empty(), "{:?}", entries(root.path()));
}

#[tokio::test]
async fn sequential_stream_is_copied_and_released() {
    let root = tempfile::tempdir().unwrap();
    let engine = MarkdownEngine::new(config(root.path()).buffer_size(7).build().unwrap());

    let text = "plain text without headings\nsecond line\n";
    let result = engine
        .convert(
            DocumentStream::sequential(Cursor::new(text.as_bytes().to_vec())),
            StreamInfo::new().with_extension("txt"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.markdown, text.trim_end());
    assert_eq!(result.count(SegmentKind::Page), 1);
    assert!(result.stats.source_copied);
    assert_eq!(result.stats.source_bytes, text.len() as u64);
    assert!(entries(root.path()).is_empty(), "{:?}", entries(root.path()));
}

#[tokio::test]
async fn unknown_format_has_no_converter() {
    let root = tempfile::tempdir().unwrap();
    let engine = MarkdownEngine::new(config(root.path()).build().unwrap());
    let err = engine
        .convert(
            DocumentStream::seekable(Cursor::new(b"%PDF-1.7".to_vec())),
            StreamInfo::new().with_extension(".pdf"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MdForgeError::NoConverter { .. }), "{err}");
    assert!(entries(root.path()).is_empty());
}

// ── Materialization ──────────────────────────────────────────────────────────

#[tokio::test]
async fn non_seekable_4096_bytes_with_256_byte_buffer() {
    let root = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let mock = tokio_test::io::Builder::new()
        .read(&payload[..1000])
        .read(&payload[1000..])
        .build();
    let sink = Arc::new(RecordingProgressSink::new());

    let materializer = Materializer::new(MaterializeOptions {
        buffer_size: 256,
        workspace_root: root.path().to_path_buf(),
    })
    .with_progress(Some(sink.clone()));
    let mut stream = DocumentStream::sequential(mock);
    let source = materializer
        .materialize(&mut stream, &StreamInfo::new(), ".bin", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(source.path()).unwrap(), payload);
    let events = sink.stage("materialize");
    assert!(!events.is_empty());
    assert!(events.windows(2).all(|w| w[0].completed < w[1].completed));
    assert_eq!(events.last().unwrap().completed, 4096);

    source.release().unwrap();
    assert!(entries(root.path()).is_empty());
}

#[tokio::test]
async fn failed_materialization_leaves_nothing_behind() {
    let root = tempfile::tempdir().unwrap();
    let mock = tokio_test::io::Builder::new()
        .read(b"partial content")
        .read_error(std::io::Error::other("disk unplugged"))
        .build();

    let engine = MarkdownEngine::new(config(root.path()).build().unwrap());
    let err = engine
        .convert(
            DocumentStream::sequential(mock),
            StreamInfo::new().with_extension(".txt"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MdForgeError::Materialization { .. }), "{err}");
    assert!(entries(root.path()).is_empty(), "{:?}", entries(root.path()));
}

// ── Composition ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn annotated_fixture_and_title_ignore_image_comments() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = write_input(input_dir.path(), "sample.fixture", "ignored");

    let engine = fixture_engine(
        config(root.path())
            .segment_options(SegmentOptions {
                include_segment_metadata_in_markdown: true,
                ..SegmentOptions::default()
            })
            .middleware(Arc::new(ArtifactPersistenceMiddleware))
            .build()
            .unwrap(),
    );
    let result = engine
        .convert_path(&input, &CancellationToken::new())
        .await
        .unwrap();

    assert!(
        result.markdown.contains("[page:1]\n# Actual Title\nBody"),
        "{}",
        result.markdown
    );
    assert!(result.markdown.contains("[table:1]\n| a | b |"), "{}", result.markdown);
    assert!(result.markdown.starts_with("[image:1]\n<!-- Image description:"));
    assert_eq!(result.title.as_deref(), Some("Actual Title"));
    assert_eq!(derive_title(&result.segments).as_deref(), Some("Actual Title"));

    // Composition is a pure function of the segment list.
    let options = engine.config().segment_options.clone();
    assert_eq!(compose(&result.segments, &options), compose(&result.segments, &options));
    assert_eq!(compose(&result.segments, &options), result.markdown);

    let image = &result.artifacts.images[0];
    assert_eq!(image.mime_type.as_deref(), Some("image/png"));
    assert!(image
        .file_path
        .as_ref()
        .is_some_and(|p| p.ends_with("images/image-1.png")));
}

#[tokio::test]
async fn composition_reflects_middleware_edits() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = write_input(input_dir.path(), "a.md", "# Only\ntext\n");

    let engine = MarkdownEngine::new(
        config(root.path())
            .middleware(Arc::new(AppendSegment))
            .build()
            .unwrap(),
    );
    let result = engine
        .convert_path(&input, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.markdown, "# Only\ntext\n\nAppended by middleware");
    assert_eq!(result.stats.segment_count, 2);
}

// ── Workspace lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn kept_workspace_survives_disposal() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = write_input(input_dir.path(), "report.txt", "body\n");

    let engine = MarkdownEngine::new(
        config(root.path())
            .segment_options(SegmentOptions {
                keep_artifact_directory: true,
                ..SegmentOptions::default()
            })
            .storage_options(ArtifactStorageOptions {
                persist_markdown: true,
                copy_source_document: true,
                ..ArtifactStorageOptions::default()
            })
            .build()
            .unwrap(),
    );
    let result = engine
        .convert_path(&input, &CancellationToken::new())
        .await
        .unwrap();

    let dir = &result.workspace.directory;
    assert!(result.workspace.retained);
    assert!(dir.exists());
    assert_eq!(std::fs::read_to_string(dir.join("document.md")).unwrap(), "body");
    assert_eq!(std::fs::read_to_string(dir.join("report.txt")).unwrap(), "body\n");
    let names: Vec<&str> = result
        .workspace
        .artifacts
        .iter()
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(names, vec!["report.txt", "document.md"]);
}

#[tokio::test]
async fn storage_backed_workspace_is_emptied_on_dispose() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = write_input(input_dir.path(), "doc.md", "# Stored\n");
    let storage = Arc::new(MemoryStorage::new());

    let factory_storage = storage.clone();
    let engine = MarkdownEngine::new(
        config(root.path())
            .storage_options(ArtifactStorageOptions {
                storage_factory: Some(memory_factory(factory_storage)),
                delete_on_dispose: true,
                persist_markdown: true,
                ..ArtifactStorageOptions::default()
            })
            .build()
            .unwrap(),
    );
    let result = engine
        .convert_path(&input, &CancellationToken::new())
        .await
        .unwrap();

    let prefix = result.workspace.storage_directory.clone().unwrap();
    assert!(result.workspace.artifacts[0].remote_key.is_some());
    assert!(storage.list(&prefix).await.unwrap().is_empty());
    assert!(!result.workspace.directory.exists());
    assert!(entries(root.path()).is_empty());
}

#[tokio::test]
async fn storage_objects_remain_without_delete_on_dispose() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = write_input(input_dir.path(), "doc.md", "# Stored\n");
    let storage = Arc::new(MemoryStorage::new());

    let factory_storage = storage.clone();
    let engine = MarkdownEngine::new(
        config(root.path())
            .storage_options(ArtifactStorageOptions {
                storage_factory: Some(memory_factory(factory_storage)),
                persist_markdown: true,
                ..ArtifactStorageOptions::default()
            })
            .build()
            .unwrap(),
    );
    let result = engine
        .convert_path(&input, &CancellationToken::new())
        .await
        .unwrap();

    let prefix = result.workspace.storage_directory.clone().unwrap();
    let keys = storage.list(&prefix).await.unwrap();
    assert_eq!(keys, vec![format!("{prefix}/document.md")]);
    assert_eq!(storage.get(&keys[0]).unwrap(), b"# Stored");
    assert!(!result.workspace.directory.exists());
}

// ── Progress ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn detailed_progress_reports_each_segment() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = write_input(input_dir.path(), "three.md", "# A\n1\n# B\n2\n# C\n3\n");

    for (level, expected) in [
        (ProgressDetailLevel::Detailed, vec![1u64, 2, 3]),
        (ProgressDetailLevel::Basic, vec![3u64]),
    ] {
        let sink = Arc::new(RecordingProgressSink::new());
        let engine = MarkdownEngine::new(
            config(root.path())
                .middleware(Arc::new(SegmentProgressMiddleware))
                .progress_detail(level)
                .progress_sink(sink.clone())
                .build()
                .unwrap(),
        );
        engine
            .convert_path(&input, &CancellationToken::new())
            .await
            .unwrap();

        let events = sink.stage("segments");
        let completed: Vec<u64> = events.iter().map(|e| e.completed).collect();
        assert_eq!(completed, expected, "{level:?}");
        assert!(events.iter().all(|e| e.total == Some(3)));
    }
}

// ── Failure paths ────────────────────────────────────────────────────────────

#[tokio::test]
async fn middleware_failure_names_stage_and_cleans_up() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = write_input(input_dir.path(), "a.md", "# A\n");

    let stages: Vec<SharedMiddleware> = vec![Arc::new(AlwaysFails), Arc::new(AppendSegment)];
    let mut builder = config(root.path());
    for stage in stages {
        builder = builder.middleware(stage);
    }
    let engine = MarkdownEngine::new(builder.build().unwrap());

    let err = engine
        .convert_path(&input, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.failed_stage(), Some("always-fails"));
    assert!(err.to_string().contains("service unavailable"), "{err}");
    assert!(entries(root.path()).is_empty(), "{:?}", entries(root.path()));
}

#[tokio::test]
async fn cancelled_conversion_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let engine = MarkdownEngine::new(config(root.path()).build().unwrap());
    let token = CancellationToken::new();
    token.cancel();

    let before = diagnostics::snapshot();
    let err = engine
        .convert(
            DocumentStream::sequential(Cursor::new(b"text".to_vec())),
            StreamInfo::new().with_extension("txt"),
            &token,
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "{err}");
    assert!(diagnostics::snapshot().conversions_cancelled > before.conversions_cancelled);
    assert!(entries(root.path()).is_empty());
}

// ── Batch and file output ────────────────────────────────────────────────────

#[tokio::test]
async fn convert_many_keeps_input_order() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let inputs: Vec<String> = (1..=4)
        .map(|i| {
            write_input(input_dir.path(), &format!("doc{i}.md"), &format!("# Doc {i}\n"))
                .display()
                .to_string()
        })
        .chain(std::iter::once(
            input_dir.path().join("missing.md").display().to_string(),
        ))
        .collect();

    let engine = MarkdownEngine::new(config(root.path()).build().unwrap());
    let results = engine
        .convert_many(&inputs, 3, &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 5);
    for (i, result) in results.iter().take(4).enumerate() {
        let result = result.as_ref().unwrap();
        assert_eq!(result.title.as_deref(), Some(format!("Doc {}", i + 1).as_str()));
    }
    assert!(matches!(results[4], Err(MdForgeError::FileNotFound { .. })));

    let mut ids: Vec<&str> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|r| r.workspace.id.as_str())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4, "each conversion owns its workspace");
}

#[tokio::test]
async fn convert_to_file_writes_atomically() {
    let input_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let input = write_input(input_dir.path(), "in.txt", "hello\n");
    let output = out_dir.path().join("nested/out.md");

    let engine = MarkdownEngine::new(config(root.path()).build().unwrap());
    engine
        .convert_to_file(&input.display().to_string(), &output, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "hello");
    assert!(!output.with_extension("md.tmp").exists());
}

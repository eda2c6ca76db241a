//! Export Module
//!
//! Renders a complete session as a ZIP archive or as one self-contained HTML page. Both
//! exports are pure functions of the session snapshot and its artifacts, so exporting the
//! same session twice yields identical bytes.

use crate::artifact::{ArtifactSet, ImageArtifact};
use crate::document::Document;
use crate::error::{Result, WorkflowError};
use crate::session::{Session, SessionStatus};
use base64::Engine;
use pulldown_cmark::{CowStr, Event, Options, Parser, Tag, html};
use pulldown_cmark_escape::escape_html;
use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

pub const SOURCES_FILE: &str = "images/sources.txt";

fn ensure_complete(session: &Session) -> Result<()> {
    if session.status == SessionStatus::Complete {
        Ok(())
    } else {
        Err(WorkflowError::SessionNotReady {
            status: session.status,
        })
    }
}

fn zip_error(e: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Internal(format!("Failed to build archive: {e}"))
}

/// Claims a unique archive path for `name`, moving it under `extra_<n>/` when taken.
fn claim_entry(name: &str, taken: &mut BTreeSet<String>) -> String {
    let mut candidate = name.to_string();
    let mut n = 1;
    while taken.contains(&candidate) {
        candidate = format!("extra_{n}/{name}");
        n += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

/// Packs every text artifact (lexical order) and image (ordinal order) into a ZIP.
///
/// Images known only by URL are listed in `images/sources.txt` instead of being embedded.
pub fn to_zip(session: &Session, artifacts: &ArtifactSet) -> Result<Vec<u8>> {
    ensure_complete(session)?;

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    // Image paths and the sources list win over text files with the same name.
    let mut taken: BTreeSet<String> = artifacts
        .images()
        .iter()
        .map(ImageArtifact::archive_path)
        .collect();
    taken.insert(SOURCES_FILE.to_string());

    for (name, content) in artifacts.texts() {
        let entry = claim_entry(name, &mut taken);
        writer.start_file(entry, options).map_err(zip_error)?;
        writer.write_all(content.as_bytes()).map_err(zip_error)?;
    }

    let mut references = String::new();
    for image in artifacts.images() {
        match &image.bytes {
            Some(bytes) if !bytes.is_empty() => {
                writer
                    .start_file(image.archive_path(), options)
                    .map_err(zip_error)?;
                writer.write_all(bytes).map_err(zip_error)?;
            }
            _ => {
                if let Some(url) = &image.source_url {
                    references.push_str(&format!("{} {}\n", image.file_name(), url));
                }
            }
        }
    }
    if !references.is_empty() {
        writer.start_file(SOURCES_FILE, options).map_err(zip_error)?;
        writer
            .write_all(references.as_bytes())
            .map_err(zip_error)?;
    }

    let cursor = writer.finish().map_err(zip_error)?;
    Ok(cursor.into_inner())
}

const STYLE: &str = r#"
body { font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif; line-height: 1.6; max-width: 900px; margin: 0 auto; padding: 20px; color: #333; }
header { border-bottom: 3px solid #2563eb; margin-bottom: 30px; }
h1 { color: #2563eb; }
h2 { color: #3b82f6; margin-top: 30px; }
h3 { color: #60a5fa; }
nav ol { columns: 2; }
section.document { page-break-before: always; margin-top: 40px; }
h1.document-title { border-bottom: 2px solid #93c5fd; padding-bottom: 8px; }
table { border-collapse: collapse; width: 100%; margin: 20px 0; }
th, td { border: 1px solid #ddd; padding: 12px; text-align: left; }
th { background-color: #2563eb; color: white; }
code { background-color: #f3f4f6; padding: 2px 6px; border-radius: 3px; font-family: 'Courier New', monospace; }
pre { background-color: #f3f4f6; padding: 15px; border-radius: 5px; overflow-x: auto; }
blockquote { border-left: 4px solid #2563eb; padding-left: 20px; margin-left: 0; font-style: italic; color: #666; }
img { max-width: 100%; height: auto; margin: 20px 0; border-radius: 8px; box-shadow: 0 4px 6px rgba(0,0,0,0.1); }
.gallery figure { margin: 20px 0; }
.gallery figcaption { font-size: 0.9em; color: #666; }
@media print { body { max-width: 100%; } }
"#;

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    // Writing into a String cannot fail.
    let _ = escape_html(&mut out, text);
    out
}

fn image_src(image: &ImageArtifact) -> Option<String> {
    match &image.bytes {
        Some(bytes) if !bytes.is_empty() => Some(format!(
            "data:{};base64,{}",
            image.mime_type.as_deref().unwrap_or("image/jpeg"),
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )),
        _ => image.source_url.clone(),
    }
}

/// Resolves markdown image destinations to image artifacts and records which were used.
struct ImageResolver {
    by_reference: HashMap<String, u32>,
    sources: HashMap<u32, String>,
    referenced: BTreeSet<u32>,
}

impl ImageResolver {
    fn new(images: &[ImageArtifact]) -> Self {
        let mut by_reference = HashMap::new();
        let mut sources = HashMap::new();
        for image in images {
            let Some(src) = image_src(image) else {
                continue;
            };
            by_reference.insert(image.archive_path(), image.ordinal);
            by_reference.insert(image.file_name(), image.ordinal);
            if let Some(url) = &image.source_url {
                by_reference.insert(url.clone(), image.ordinal);
            }
            sources.insert(image.ordinal, src);
        }
        Self {
            by_reference,
            sources,
            referenced: BTreeSet::new(),
        }
    }

    fn resolve(&mut self, dest: &str) -> Option<String> {
        let key = dest.trim_start_matches("./");
        let ordinal = *self.by_reference.get(key)?;
        self.referenced.insert(ordinal);
        self.sources.get(&ordinal).cloned()
    }

    fn markdown_to_html(&mut self, markdown: &str) -> String {
        let parser = Parser::new_ext(markdown, Options::ENABLE_TABLES).map(|event| match event {
            Event::Start(Tag::Image {
                link_type,
                dest_url,
                title,
                id,
            }) => {
                let dest_url = match self.resolve(&dest_url) {
                    Some(src) => CowStr::from(src),
                    None => dest_url,
                };
                Event::Start(Tag::Image {
                    link_type,
                    dest_url,
                    title,
                    id,
                })
            }
            // Raw HTML in generated markdown is shown as text, never rendered.
            Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
            other => other,
        });
        let mut out = String::new();
        html::push_html(&mut out, parser);
        out
    }
}

fn push_section(out: &mut String, anchor: &str, title: &str, body: &str) {
    out.push_str(&format!(
        "<section class=\"document\" id=\"{}\">\n<h1 class=\"document-title\">{}</h1>\n{}</section>\n",
        escape(anchor),
        escape(title),
        body
    ));
}

/// Renders the whole guide as one HTML page with embedded styles and images.
pub fn to_html(session: &Session, artifacts: &ArtifactSet) -> Result<Vec<u8>> {
    ensure_complete(session)?;
    let request = &session.request;
    let mut resolver = ImageResolver::new(artifacts.images());

    let mut sections = Vec::new();
    for doc in Document::ALL {
        if let Some(markdown) = artifacts.text(doc.file_name()) {
            sections.push((doc.stem().to_string(), doc.title().to_string(), markdown));
        }
    }
    for (name, content) in artifacts.extras() {
        let anchor = format!("extra-{}", name.replace(|c: char| !c.is_alphanumeric(), "-"));
        sections.push((anchor, name.clone(), content.as_str()));
    }

    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n");
    out.push_str(&format!(
        "<title>Physics Experiment Guide: {}</title>\n<style>{}</style>\n</head>\n<body>\n",
        escape(&request.description),
        STYLE
    ));

    out.push_str("<header>\n<h1>Physics Experiment Guide</h1>\n");
    out.push_str(&format!(
        "<p class=\"description\">{}</p>\n",
        escape(&request.description)
    ));
    if let Some(student) = &request.student_name {
        out.push_str(&format!(
            "<p class=\"student\">Prepared for {}</p>\n",
            escape(student)
        ));
    }
    out.push_str(&format!(
        "<p class=\"meta\">{} &middot; Generated {}</p>\n</header>\n",
        escape(&request.grade_level),
        session.created_at.format("%Y-%m-%d")
    ));

    out.push_str("<nav>\n<h2>Contents</h2>\n<ol>\n");
    for (anchor, title, _) in &sections {
        out.push_str(&format!(
            "<li><a href=\"#{}\">{}</a></li>\n",
            escape(anchor),
            escape(title)
        ));
    }
    out.push_str("</ol>\n</nav>\n");

    for (anchor, title, markdown) in &sections {
        let body = resolver.markdown_to_html(markdown);
        push_section(&mut out, anchor, title, &body);
    }

    let gallery: Vec<&ImageArtifact> = artifacts
        .images()
        .iter()
        .filter(|img| !resolver.referenced.contains(&img.ordinal))
        .filter(|img| resolver.sources.contains_key(&img.ordinal))
        .collect();
    if !gallery.is_empty() {
        out.push_str("<section class=\"gallery\" id=\"images\">\n<h1 class=\"document-title\">Images</h1>\n");
        for image in gallery {
            let caption = image
                .prompt
                .clone()
                .or_else(|| image.source_url.clone())
                .unwrap_or_else(|| image.file_name());
            out.push_str(&format!(
                "<figure><img src=\"{}\" alt=\"{}\"><figcaption>{}</figcaption></figure>\n",
                escape(&resolver.sources[&image.ordinal]),
                escape(&image.file_name()),
                escape(&caption)
            ));
        }
        out.push_str("</section>\n");
    }

    out.push_str("</body>\n</html>\n");
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactIndex, ImageSource};
    use crate::image::ImageStyle;
    use crate::session::GenerationRequest;
    use chrono::{TimeZone, Utc};
    use std::io::Read;

    fn session(status: SessionStatus) -> Session {
        let created = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let mut request = GenerationRequest::new("Pendulum length vs period <simple>");
        request.student_name = Some("Ada".into());
        Session {
            id: uuid::Uuid::nil(),
            status,
            created_at: created,
            updated_at: created,
            request,
            events: Vec::new(),
            artifacts: ArtifactIndex::new(),
            error: None,
            partial_files: Vec::new(),
        }
    }

    fn documents() -> ArtifactSet {
        let mut set = ArtifactSet::new();
        for doc in Document::ALL {
            set.insert_text(doc.file_name(), format!("# {}\n\nBody of {}.", doc.title(), doc.stem()));
        }
        set
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn png(source_url: Option<&str>) -> ImageArtifact {
        ImageArtifact {
            ordinal: 0,
            source: ImageSource::Generated,
            mime_type: Some("image/png".into()),
            source_url: source_url.map(str::to_string),
            prompt: Some("pendulum diagram".into()),
            style: Some(ImageStyle::Diagram),
            bytes: Some(vec![0x89, 0x50, 0x4E, 0x47]),
        }
    }

    #[test]
    fn test_exports_require_complete_session() {
        let set = documents();
        for status in [
            SessionStatus::Pending,
            SessionStatus::Running,
            SessionStatus::Failed,
        ] {
            let s = session(status);
            assert_eq!(
                to_zip(&s, &set).unwrap_err(),
                WorkflowError::SessionNotReady { status }
            );
            assert_eq!(
                to_html(&s, &set).unwrap_err(),
                WorkflowError::SessionNotReady { status }
            );
        }
    }

    #[test]
    fn test_zip_contains_exactly_the_documents() {
        let bytes = to_zip(&session(SessionStatus::Complete), &documents()).unwrap();
        let names = entry_names(&bytes);
        let mut expected: Vec<String> = Document::ALL
            .iter()
            .map(|d| d.file_name().to_string())
            .collect();
        expected.sort();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_exports_are_byte_identical() {
        let s = session(SessionStatus::Complete);
        let mut set = documents();
        set.push_image(png(None));
        assert_eq!(to_zip(&s, &set).unwrap(), to_zip(&s, &set).unwrap());
        assert_eq!(to_html(&s, &set).unwrap(), to_html(&s, &set).unwrap());
    }

    #[test]
    fn test_zip_layout_with_images() {
        let mut set = documents();
        set.insert_text("experiment_request.txt", "pendulum");
        set.push_image(png(None));
        set.push_image(ImageArtifact::searched("https://img.example/ref.jpg"));
        let bytes = to_zip(&session(SessionStatus::Complete), &set).unwrap();
        let names = entry_names(&bytes);

        assert_eq!(names.len(), 10);
        assert!(names.contains(&"experiment_request.txt".to_string()));
        assert!(names.contains(&"images/image_001_generated.png".to_string()));
        assert!(!names.iter().any(|n| n.contains("image_002")));
        assert_eq!(names.last().unwrap(), SOURCES_FILE);

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();
        let mut sources = String::new();
        archive
            .by_name(SOURCES_FILE)
            .unwrap()
            .read_to_string(&mut sources)
            .unwrap();
        assert_eq!(sources, "image_002_searched.jpg https://img.example/ref.jpg\n");
    }

    #[test]
    fn test_zip_moves_text_files_that_shadow_image_paths() {
        let mut set = documents();
        set.insert_text(SOURCES_FILE, "model-written list");
        set.insert_text("images/image_001_generated.png", "not an image");
        set.push_image(png(None));
        set.push_image(ImageArtifact::searched("https://img.example/ref.jpg"));

        let bytes = to_zip(&session(SessionStatus::Complete), &set).unwrap();
        let names = entry_names(&bytes);
        let unique: BTreeSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert_eq!(names.len(), 11);
        assert!(names.contains(&"extra_1/images/sources.txt".to_string()));
        assert!(names.contains(&"extra_1/images/image_001_generated.png".to_string()));

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();
        let mut image = Vec::new();
        archive
            .by_name("images/image_001_generated.png")
            .unwrap()
            .read_to_end(&mut image)
            .unwrap();
        assert_eq!(image, vec![0x89, 0x50, 0x4E, 0x47]);
    }

    #[test]
    fn test_html_shows_raw_html_as_text() {
        let mut set = documents();
        set.insert_text(
            "methodology.md",
            "# Setup\n\n<script>alert('x')</script>\n\nUse a <b>long</b> string.\n",
        );
        let html = String::from_utf8(to_html(&session(SessionStatus::Complete), &set).unwrap())
            .unwrap();
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<b>long</b>"));
        assert!(html.contains("&lt;b&gt;long&lt;/b&gt;"));
    }

    #[test]
    fn test_html_orders_documents_and_escapes_header() {
        let mut set = documents();
        set.insert_text("appendix.md", "# Appendix");
        let html = String::from_utf8(to_html(&session(SessionStatus::Complete), &set).unwrap())
            .unwrap();

        assert!(html.contains("Pendulum length vs period &lt;simple&gt;"));
        assert!(html.contains("Prepared for Ada"));
        assert!(html.contains("Generated 2025-03-14"));
        let positions: Vec<usize> = Document::ALL
            .iter()
            .map(|d| html.find(&format!("id=\"{}\"", d.stem())).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        let appendix = html.find("id=\"extra-appendix-md\"").unwrap();
        assert!(appendix > positions[6]);
        assert!(!html.contains("class=\"gallery\""));
    }

    #[test]
    fn test_html_renders_tables() {
        let mut set = documents();
        set.insert_text(
            "data_template.md",
            "| Length (m) | Period (s) |\n|---|---|\n| 0.5 | |\n",
        );
        let html = String::from_utf8(to_html(&session(SessionStatus::Complete), &set).unwrap())
            .unwrap();
        assert!(html.contains("<table>"));
        assert!(html.contains("<th>Length (m)</th>"));
    }

    #[test]
    fn test_html_inlines_referenced_images_and_galleries_the_rest() {
        let mut set = documents();
        set.insert_text(
            "methodology.md",
            "# Setup\n\n![setup](images/image_001_generated.png)\n\n![web](https://img.example/ref.jpg)\n",
        );
        set.push_image(png(None));
        set.push_image(ImageArtifact::searched("https://img.example/ref.jpg"));
        set.push_image(png(Some("https://gen.example/3.png")));

        let html = String::from_utf8(to_html(&session(SessionStatus::Complete), &set).unwrap())
            .unwrap();
        assert!(html.contains("src=\"data:image/png;base64,iVBORw==\""));
        assert!(!html.contains("images/image_001_generated.png"));
        assert!(html.contains("src=\"https://img.example/ref.jpg\""));

        let gallery = &html[html.find("class=\"gallery\"").unwrap()..];
        assert!(gallery.contains("image_003_generated.png"));
        assert!(!gallery.contains("image_001"));
        assert!(!gallery.contains("image_002"));
    }

    #[test]
    fn test_escape() {
        assert_eq!(
            escape(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }
}

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use std::collections::HashMap;
use std::path::Path;

use crate::types::DocumentFormat;

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub content: String,
    pub title: String,
    pub metadata: HashMap<String, String>,
    pub format: DocumentFormat,
}

pub struct DocumentParser;

impl DocumentParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_file(&self, path: &Path) -> Result<ParsedDocument> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("txt")
            .to_lowercase();

        let format = DocumentFormat::from_extension(&extension);
        // Use file stem (without extension) for a cleaner display title
        let title = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("untitled")
            .to_string();

        if extension == "doc" || extension == "xls" {
            return Err(anyhow::anyhow!(
                "legacy format .{} is not supported: {}",
                extension,
                path.display()
            ));
        }

        let content = match extension.as_str() {
            "pdf" => self.parse_pdf(path)?,
            "docx" => self.parse_docx(path)?,
            "xlsx" => self.parse_spreadsheet(path)?,
            _ => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read text file: {}", path.display()))?,
        };

        let mut metadata = HashMap::new();
        metadata.insert("file_path".to_string(), path.display().to_string());
        metadata.insert("file_extension".to_string(), extension.clone());

        if let Ok(meta) = std::fs::metadata(path) {
            metadata.insert("file_size".to_string(), meta.len().to_string());
        }

        Ok(ParsedDocument {
            content,
            title,
            metadata,
            format,
        })
    }

    /// Per-page extraction: pages are parsed independently via lopdf, joined
    /// by newline; a page whose content stream yields no usable text is
    /// skipped with a warning rather than failing the whole document (§4.1).
    /// Falls back to `pdf_extract`'s whole-document extraction only if lopdf
    /// cannot load the file at all.
    fn parse_pdf(&self, path: &Path) -> Result<String> {
        match super::lopdf_parser::LoPdfParser::parse(path) {
            Ok(lopdf_doc) => {
                let mut readable_pages = Vec::with_capacity(lopdf_doc.pages.len());
                for page in &lopdf_doc.pages {
                    let text = page.text.trim();
                    if text.is_empty() {
                        tracing::warn!(
                            page = page.page_number,
                            "PDF page produced no extractable text, skipping: {}",
                            path.display()
                        );
                        continue;
                    }
                    readable_pages.push(text.to_string());
                }

                if !readable_pages.is_empty() {
                    return Ok(readable_pages.join("\n"));
                }
            }
            Err(e) => {
                tracing::debug!("lopdf extraction failed for {}: {}", path.display(), e);
            }
        }

        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read PDF: {}", path.display()))?;
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .with_context(|| format!("pdf_extract failed: {}", path.display()))?;
        let cleaned = text
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if cleaned.is_empty() {
            return Err(anyhow::anyhow!(
                "PDF contains no extractable text (scanned/image-based): {}",
                path.display()
            ));
        }

        Ok(cleaned)
    }

    fn parse_docx(&self, path: &Path) -> Result<String> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open DOCX: {}", path.display()))?;

        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("Failed to read DOCX as ZIP: {}", path.display()))?;

        let mut xml_content = String::new();
        {
            let mut document_xml = archive
                .by_name("word/document.xml")
                .with_context(|| format!("DOCX missing word/document.xml: {}", path.display()))?;
            use std::io::Read;
            document_xml
                .read_to_string(&mut xml_content)
                .with_context(|| "Failed to read document.xml from DOCX")?;
        }

        let text = extract_docx_text(&xml_content);

        if text.is_empty() {
            return Err(anyhow::anyhow!(
                "DOCX contains no extractable text: {}",
                path.display()
            ));
        }

        Ok(text)
    }

    /// Each sheet is emitted as `Sheet: <name>\n` followed by its rows as TSV (§4.1).
    fn parse_spreadsheet(&self, path: &Path) -> Result<String> {
        let mut workbook = open_workbook_auto(path)
            .with_context(|| format!("Failed to open spreadsheet: {}", path.display()))?;

        let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
        if sheet_names.is_empty() {
            return Err(anyhow::anyhow!("Spreadsheet has no sheets: {}", path.display()));
        }

        let mut all_text = String::new();

        for sheet_name in &sheet_names {
            let range = match workbook.worksheet_range(sheet_name) {
                Ok(r) => r,
                Err(_) => continue,
            };

            if range.is_empty() {
                continue;
            }

            all_text.push_str(&format!("Sheet: {}\n", sheet_name));

            for row in range.rows() {
                let cells: Vec<String> = row.iter().map(cell_to_string).collect();
                if cells.iter().all(|c| c.is_empty()) {
                    continue;
                }
                all_text.push_str(&cells.join("\t"));
                all_text.push('\n');
            }
        }

        if all_text.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Spreadsheet contains no data: {}",
                path.display()
            ));
        }

        Ok(all_text)
    }

    pub fn parse_content(
        &self,
        content: &str,
        format: DocumentFormat,
        title: &str,
    ) -> ParsedDocument {
        ParsedDocument {
            content: content.to_string(),
            title: title.to_string(),
            metadata: HashMap::new(),
            format,
        }
    }
}

/// Convert a calamine cell to a clean string representation.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Use integer display when the float is a whole number (e.g. 1500.0 → "1500")
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                (*f as i64).to_string()
            } else {
                format!("{:.4}", f).trim_end_matches('0').trim_end_matches('.').to_string()
            }
        }
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::Error(e) => format!("#ERR:{:?}", e),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

/// Extract text from DOCX XML by parsing <w:t> elements within <w:p> paragraphs
fn extract_docx_text(xml: &str) -> String {
    let mut result = String::new();
    let mut pos = 0;

    while pos < xml.len() {
        if let Some(p_start) = xml[pos..].find("<w:p") {
            let abs_p_start = pos + p_start;

            let p_end = if let Some(end) = xml[abs_p_start..].find("</w:p>") {
                abs_p_start + end + 6
            } else {
                xml.len()
            };

            let paragraph = &xml[abs_p_start..p_end];
            let mut para_text = String::new();
            let mut t_pos = 0;

            while t_pos < paragraph.len() {
                if let Some(t_start) = paragraph[t_pos..].find("<w:t") {
                    let abs_t_start = t_pos + t_start;
                    if let Some(tag_end) = paragraph[abs_t_start..].find('>') {
                        let content_start = abs_t_start + tag_end + 1;
                        if let Some(t_end) = paragraph[content_start..].find("</w:t>") {
                            para_text.push_str(&paragraph[content_start..content_start + t_end]);
                            t_pos = content_start + t_end + 6;
                        } else {
                            t_pos = content_start;
                        }
                    } else {
                        t_pos = abs_t_start + 4;
                    }
                } else {
                    break;
                }
            }

            if !para_text.is_empty() {
                if !result.is_empty() {
                    result.push('\n');
                }
                result.push_str(&para_text);
            }

            pos = p_end;
        } else {
            break;
        }
    }

    result
}

//! SpreadsheetML (xlsx) reader and writer.
//!
//! Cell values (shared strings, inline strings, numbers, booleans) and
//! formulas with their cached result are modelled. A workbook decoded from
//! bytes remembers its package, and encoding writes onto that package: parts
//! the model does not cover, worksheet elements around `sheetData`, row
//! attributes, cell style indices and the stylesheet are written back as they
//! were read. `calcChain.xml` is dropped on write and rebuilt by Excel.
//!
//! Rows marked with [`Worksheet::style_header_row`] get the header style:
//! bold white text on a blue fill, centered. For a decoded workbook it is
//! appended to the existing stylesheet.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::ops::Range;

use tracing::debug;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::SheetError;
use crate::workbook::{CellAddress, CellValue, Formula, Workbook, Worksheet};

/// Fill color of the header style.
pub const HEADER_FILL_RGB: &str = "FF4472C4";
/// Font color of the header style.
pub const HEADER_FONT_RGB: &str = "FFFFFFFF";

const NS_MAIN: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const NS_REL: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const REL_OFFICE_DOC: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
const REL_WORKSHEET: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
const REL_STYLES: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles";
const CT_WORKSHEET: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";
const CT_STYLES: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml";

const CONTENT_TYPES: &str = "[Content_Types].xml";
const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS: &str = "xl/_rels/workbook.xml.rels";

/// Raw parts of a decoded xlsx package, in archive order.
#[derive(Clone, PartialEq)]
pub(crate) struct Package {
    parts: Vec<(String, Vec<u8>)>,
    /// Worksheet part names in workbook order.
    sheet_parts: Vec<String>,
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.parts.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("Package")
            .field("parts", &names)
            .field("sheet_parts", &self.sheet_parts)
            .finish()
    }
}

impl Package {
    fn text(&self, name: &str) -> Result<Option<String>, SheetError> {
        self.parts
            .iter()
            .find(|(part, _)| part == name)
            .map(|(_, bytes)| {
                String::from_utf8(bytes.clone())
                    .map_err(|_| SheetError::Malformed(format!("{} is not UTF-8", name)))
            })
            .transpose()
    }

    fn required_text(&self, name: &str) -> Result<String, SheetError> {
        self.text(name)?
            .ok_or_else(|| SheetError::Malformed(format!("missing {}", name)))
    }
}

fn put_part(parts: &mut Vec<(String, Vec<u8>)>, name: &str, body: String) {
    match parts.iter_mut().find(|(part, _)| part.as_str() == name) {
        Some((_, bytes)) => *bytes = body.into_bytes(),
        None => parts.push((name.to_string(), body.into_bytes())),
    }
}

/// Serialize a workbook into xlsx bytes.
pub fn encode(workbook: &Workbook) -> Result<Vec<u8>, SheetError> {
    if workbook.sheets.is_empty() {
        return Err(SheetError::Malformed("workbook has no sheets".to_string()));
    }

    let parts = match &workbook.package {
        Some(package) if keeps_package_sheets(workbook, package) => {
            encode_onto(workbook, package)?
        }
        Some(_) => {
            debug!("Workbook sheets were reordered or removed, writing a new package");
            new_package(workbook)
        }
        None => new_package(workbook),
    };

    let bytes = write_archive(&parts)?;
    debug!(
        "Encoded workbook with {} sheets ({} bytes)",
        workbook.sheets.len(),
        bytes.len()
    );
    Ok(bytes)
}

/// Parse xlsx bytes into a workbook.
pub fn decode(data: &[u8]) -> Result<Workbook, SheetError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mut parts = Vec::with_capacity(archive.len());
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        parts.push((name, bytes));
    }
    let mut package = Package {
        parts,
        sheet_parts: Vec::new(),
    };

    let workbook_xml = package
        .text(WORKBOOK_PART)?
        .ok_or_else(|| SheetError::Malformed("missing xl/workbook.xml".to_string()))?;
    let rels_xml = package
        .text(WORKBOOK_RELS)?
        .ok_or_else(|| SheetError::Malformed("missing workbook relationships".to_string()))?;
    let relationships = parse_relationships(&rels_xml)?;

    let shared_part = relationships
        .iter()
        .find(|r| r.kind.ends_with("/sharedStrings"))
        .map(|r| resolve_target(&r.target))
        .unwrap_or_else(|| "xl/sharedStrings.xml".to_string());
    let shared = match package.text(&shared_part)? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };

    let (entries, active) = parse_workbook(&workbook_xml)?;
    let mut sheets = Vec::with_capacity(entries.len());
    for (name, rel_id) in entries {
        let target = relationships
            .iter()
            .find(|r| r.id == rel_id)
            .map(|r| r.target.as_str())
            .ok_or_else(|| {
                SheetError::Malformed(format!("sheet '{}' has no relationship {}", name, rel_id))
            })?;
        let part = resolve_target(target);
        let xml = package
            .text(&part)?
            .ok_or_else(|| SheetError::Malformed(format!("missing sheet part {}", part)))?;
        let mut sheet = parse_sheet(name, &xml, &shared)?;
        sheet.part = Some(part.clone());
        package.sheet_parts.push(part);
        sheets.push(sheet);
    }

    if sheets.is_empty() {
        return Err(SheetError::Malformed("workbook has no sheets".to_string()));
    }
    let active = active.min(sheets.len() - 1);

    // Without a content types part there is nothing to write onto.
    let has_content_types = package.parts.iter().any(|(name, _)| name == CONTENT_TYPES);
    Ok(Workbook {
        sheets,
        active,
        package: has_content_types.then_some(package),
    })
}

fn write_archive(parts: &[(String, Vec<u8>)]) -> Result<Vec<u8>, SheetError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, body) in parts {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(body)?;
    }
    Ok(writer.finish()?.into_inner())
}

fn resolve_target(target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        absolute.to_string()
    } else {
        format!("xl/{}", target)
    }
}

struct Relationship {
    id: String,
    kind: String,
    target: String,
    range: Range<usize>,
}

fn parse_relationships(xml: &str) -> Result<Vec<Relationship>, SheetError> {
    let doc = roxmltree::Document::parse(xml)?;
    Ok(doc
        .descendants()
        .filter(|n| n.tag_name().name() == "Relationship")
        .filter_map(|n| {
            Some(Relationship {
                id: n.attribute("Id")?.to_string(),
                kind: n.attribute("Type").unwrap_or_default().to_string(),
                target: n.attribute("Target")?.to_string(),
                range: n.range(),
            })
        })
        .collect())
}

/// Sheet (name, relationship id) pairs in order, plus the active tab index.
fn parse_workbook(xml: &str) -> Result<(Vec<(String, String)>, usize), SheetError> {
    let doc = roxmltree::Document::parse(xml)?;
    let mut sheets = Vec::new();
    let mut active = 0usize;
    for node in doc.descendants() {
        match node.tag_name().name() {
            "sheet" => {
                let name = node.attribute("name").unwrap_or("Sheet").to_string();
                let rel = sheet_rel_id(&node)
                    .ok_or_else(|| SheetError::Malformed(format!("sheet '{}' has no r:id", name)))?;
                sheets.push((name, rel.to_string()));
            }
            "workbookView" => {
                active = node
                    .attribute("activeTab")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
            }
            _ => {}
        }
    }
    Ok((sheets, active))
}

fn sheet_rel_id<'a>(node: &roxmltree::Node<'a, '_>) -> Option<&'a str> {
    node.attribute((NS_REL, "id")).or_else(|| node.attribute("id"))
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>, SheetError> {
    let doc = roxmltree::Document::parse(xml)?;
    Ok(doc
        .root_element()
        .children()
        .filter(|n| n.tag_name().name() == "si")
        .map(|si| collect_text(&si))
        .collect())
}

/// Concatenate every `<t>` under a string item (plain or rich text runs).
fn collect_text(node: &roxmltree::Node) -> String {
    node.descendants()
        .filter(|d| d.tag_name().name() == "t")
        .filter_map(|d| d.text())
        .collect()
}

/// Unprefixed attributes of `node` other than those in `skip`.
fn plain_attributes(node: &roxmltree::Node, skip: &[&str]) -> Vec<(String, String)> {
    node.attributes()
        .filter(|a| a.namespace().is_none() && !skip.contains(&a.name()))
        .map(|a| (a.name().to_string(), a.value().to_string()))
        .collect()
}

fn parse_sheet(name: String, xml: &str, shared: &[String]) -> Result<Worksheet, SheetError> {
    let doc = roxmltree::Document::parse(xml)?;
    let mut sheet = Worksheet::new(name);
    let mut next_row = 1u32;

    for row in doc.descendants().filter(|n| n.tag_name().name() == "row") {
        let row_index = row
            .attribute("r")
            .and_then(|r| r.parse().ok())
            .unwrap_or(next_row);
        next_row = row_index.saturating_add(1);

        let attributes = plain_attributes(&row, &["r", "spans"]);
        if !attributes.is_empty() {
            sheet.row_attributes.insert(row_index, attributes);
        }

        let mut next_col = 1u32;
        for cell in row.children().filter(|n| n.tag_name().name() == "c") {
            let col = match cell.attribute("r") {
                Some(address) => CellAddress::parse(address)?.col,
                None => next_col,
            };
            next_col = col.saturating_add(1);

            if let Some(style) = cell
                .attribute("s")
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|s| *s != 0)
            {
                sheet.cell_styles.insert((row_index, col), style);
            }

            let value = parse_cell_value(&cell, shared)?;
            match cell.children().find(|n| n.tag_name().name() == "f") {
                Some(f) => {
                    let formula = Formula {
                        text: f.text().unwrap_or_default().to_string(),
                        attributes: plain_attributes(&f, &[]),
                    };
                    sheet.set_formula(row_index, col, formula, value);
                }
                None => sheet.set(row_index, col, value),
            }
        }
    }

    Ok(sheet)
}

fn parse_cell_value(cell: &roxmltree::Node, shared: &[String]) -> Result<CellValue, SheetError> {
    let raw = cell
        .children()
        .find(|n| n.tag_name().name() == "v")
        .and_then(|v| v.text());

    let value = match cell.attribute("t") {
        Some("s") => {
            let idx: usize = raw
                .and_then(|r| r.trim().parse().ok())
                .ok_or_else(|| SheetError::Malformed("shared string cell without index".to_string()))?;
            let text = shared.get(idx).ok_or_else(|| {
                SheetError::Malformed(format!("shared string index {} out of range", idx))
            })?;
            CellValue::Text(text.clone())
        }
        Some("inlineStr") => cell
            .children()
            .find(|n| n.tag_name().name() == "is")
            .map(|is| CellValue::Text(collect_text(&is)))
            .unwrap_or(CellValue::Empty),
        Some("b") => CellValue::Bool(raw.map(str::trim) == Some("1")),
        Some("str") | Some("e") => raw.map(|r| CellValue::Text(r.to_string())).unwrap_or_default(),
        _ => match raw.map(str::trim) {
            Some(r) if !r.is_empty() => r
                .parse::<f64>()
                .map(CellValue::Number)
                .unwrap_or_else(|_| CellValue::Text(r.to_string())),
            _ => CellValue::Empty,
        },
    };
    Ok(value)
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Control characters other than tab/newline/CR are not valid XML 1.0.
            c if (c as u32) < 0x20 && !matches!(c, '\t' | '\n' | '\r') => {}
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Writing onto a decoded package
// ---------------------------------------------------------------------------

/// True when the package's sheets are still the workbook's leading sheets, in order.
fn keeps_package_sheets(workbook: &Workbook, package: &Package) -> bool {
    let leading: Vec<&str> = workbook
        .sheets
        .iter()
        .map_while(|s| s.part.as_deref())
        .collect();
    let all = workbook.sheets.iter().filter(|s| s.part.is_some()).count();
    leading.len() == all && leading == package.sheet_parts
}

fn encode_onto(workbook: &Workbook, package: &Package) -> Result<Vec<(String, Vec<u8>)>, SheetError> {
    let mut parts = package.parts.clone();
    let mut workbook_xml = package.required_text(WORKBOOK_PART)?;
    let mut rels_xml = package.required_text(WORKBOOK_RELS)?;
    let mut types_xml = package.required_text(CONTENT_TYPES)?;

    let relationships = parse_relationships(&rels_xml)?;
    let mut used_ids: BTreeSet<String> = relationships.iter().map(|r| r.id.clone()).collect();

    if let Some(rel) = relationships.iter().find(|r| r.kind.ends_with("/calcChain")) {
        let part = resolve_target(&rel.target);
        rels_xml = apply_edits(&rels_xml, vec![Edit::remove(rel.range.clone())]);
        types_xml = remove_override(&types_xml, &part)?;
        parts.retain(|(name, _)| *name != part);
        debug!("Dropped {}", part);
    }

    let header_style = if workbook.sheets.iter().any(|s| !s.header_style_rows.is_empty()) {
        match relationships.iter().find(|r| r.kind.ends_with("/styles")) {
            Some(rel) => {
                let part = resolve_target(&rel.target);
                let (styles, index) = add_header_style(&package.required_text(&part)?)?;
                put_part(&mut parts, &part, styles);
                index
            }
            None => {
                put_part(&mut parts, "xl/styles.xml", styles_xml());
                let id = next_rel_id(&mut used_ids);
                rels_xml = append_relationship(&rels_xml, &id, REL_STYLES, "styles.xml")?;
                types_xml = add_override(&types_xml, "/xl/styles.xml", CT_STYLES)?;
                1
            }
        }
    } else {
        0
    };

    // (name, relationship id) of sheets not yet in the workbook part
    let mut added = Vec::new();
    for sheet in &workbook.sheets {
        match sheet.part.as_deref() {
            Some(part) => {
                let raw = package.required_text(part)?;
                put_part(&mut parts, part, splice_sheet_data(&raw, sheet, header_style)?);
            }
            None => {
                let part = (1..)
                    .map(|n| format!("xl/worksheets/sheet{}.xml", n))
                    .find(|name| parts.iter().all(|(existing, _)| existing != name))
                    .unwrap_or_default();
                let id = next_rel_id(&mut used_ids);
                let target = part.trim_start_matches("xl/").to_string();
                rels_xml = append_relationship(&rels_xml, &id, REL_WORKSHEET, &target)?;
                types_xml = add_override(&types_xml, &format!("/{}", part), CT_WORKSHEET)?;
                put_part(&mut parts, &part, sheet_xml(sheet, header_style, true));
                added.push((sheet.name.as_str(), id));
            }
        }
    }

    workbook_xml = update_workbook_part(&workbook_xml, workbook, &added)?;

    put_part(&mut parts, WORKBOOK_PART, workbook_xml);
    put_part(&mut parts, WORKBOOK_RELS, rels_xml);
    put_part(&mut parts, CONTENT_TYPES, types_xml);
    Ok(parts)
}

/// Renamed sheets, appended sheets and the active tab.
fn update_workbook_part(
    xml: &str,
    workbook: &Workbook,
    added: &[(&str, String)],
) -> Result<String, SheetError> {
    let doc = roxmltree::Document::parse(xml)?;
    let sheets_node = doc
        .descendants()
        .find(|n| n.tag_name().name() == "sheets")
        .ok_or_else(|| SheetError::Malformed("workbook has no <sheets>".to_string()))?;
    let existing: Vec<roxmltree::Node> = sheets_node
        .children()
        .filter(|n| n.tag_name().name() == "sheet")
        .collect();

    let mut edits = Vec::new();
    for (node, sheet) in existing.iter().zip(&workbook.sheets) {
        if node.attribute("name") != Some(sheet.name.as_str()) {
            edits.push(set_attribute(xml, node, "name", &sheet.name));
        }
    }

    if !added.is_empty() {
        let prefix = prefix_of(&xml[sheets_node.range()]);
        let mut next_sheet_id = existing
            .iter()
            .filter_map(|n| n.attribute("sheetId").and_then(|v| v.parse::<u32>().ok()))
            .max()
            .unwrap_or(0);
        let mut children = String::new();
        for (name, id) in added {
            next_sheet_id += 1;
            children.push_str(&format!(
                r#"<{p}sheet xmlns:r="{ns}" name="{name}" sheetId="{sheet_id}" r:id="{id}"/>"#,
                p = prefix,
                ns = NS_REL,
                name = escape_xml(name),
                sheet_id = next_sheet_id,
                id = id,
            ));
        }
        edits.extend(append_child(xml, &sheets_node, &children));
    }

    let active = workbook.active.to_string();
    match doc.descendants().find(|n| n.tag_name().name() == "workbookView") {
        Some(view) if view.attribute("activeTab").unwrap_or("0") != active => {
            edits.push(set_attribute(xml, &view, "activeTab", &active));
        }
        Some(_) => {}
        None if workbook.active != 0 => {
            let prefix = prefix_of(&xml[sheets_node.range()]);
            let at = sheets_node.range().start;
            edits.push(Edit {
                range: at..at,
                text: format!(
                    r#"<{p}bookViews><{p}workbookView activeTab="{a}"/></{p}bookViews>"#,
                    p = prefix,
                    a = active
                ),
            });
        }
        None => {}
    }

    Ok(apply_edits(xml, edits))
}

fn next_rel_id(used: &mut BTreeSet<String>) -> String {
    let id = (1..)
        .map(|n| format!("rId{}", n))
        .find(|id| !used.contains(id))
        .unwrap_or_default();
    used.insert(id.clone());
    id
}

fn append_relationship(xml: &str, id: &str, kind: &str, target: &str) -> Result<String, SheetError> {
    append_to(xml, "Relationships", |p| {
        format!(
            r#"<{}Relationship Id="{}" Type="{}" Target="{}"/>"#,
            p,
            id,
            kind,
            escape_xml(target)
        )
    })
}

fn add_override(xml: &str, part_name: &str, content_type: &str) -> Result<String, SheetError> {
    append_to(xml, "Types", |p| {
        format!(
            r#"<{}Override PartName="{}" ContentType="{}"/>"#,
            p,
            escape_xml(part_name),
            content_type
        )
    })
}

fn remove_override(xml: &str, part: &str) -> Result<String, SheetError> {
    let part_name = format!("/{}", part);
    let doc = roxmltree::Document::parse(xml)?;
    let edits = doc
        .descendants()
        .filter(|n| n.tag_name().name() == "Override" && n.attribute("PartName") == Some(&part_name))
        .map(|n| Edit::remove(n.range()))
        .collect();
    Ok(apply_edits(xml, edits))
}

/// Append the header style to a stylesheet. Returns the new stylesheet and
/// the header's index in `cellXfs`.
fn add_header_style(xml: &str) -> Result<(String, u32), SheetError> {
    let doc = roxmltree::Document::parse(xml)?;
    let root = doc.root_element();
    let table = |name: &str| {
        root.children()
            .find(|n| n.tag_name().name() == name)
            .ok_or_else(|| SheetError::Malformed(format!("stylesheet has no <{}>", name)))
    };
    let fonts = table("fonts")?;
    let fills = table("fills")?;
    let xfs = table("cellXfs")?;
    let count = |node: &roxmltree::Node| node.children().filter(|n| n.is_element()).count();
    let (font_id, fill_id, xf_id) = (count(&fonts), count(&fills), count(&xfs));
    let p = prefix_of(&xml[root.range()]);

    let mut edits = append_child(
        xml,
        &fonts,
        &format!(
            r#"<{p}font><{p}b/><{p}sz val="11"/><{p}color rgb="{rgb}"/><{p}name val="Calibri"/></{p}font>"#,
            p = p,
            rgb = HEADER_FONT_RGB
        ),
    );
    edits.extend(append_child(
        xml,
        &fills,
        &format!(
            r#"<{p}fill><{p}patternFill patternType="solid"><{p}fgColor rgb="{rgb}"/><{p}bgColor rgb="{rgb}"/></{p}patternFill></{p}fill>"#,
            p = p,
            rgb = HEADER_FILL_RGB
        ),
    ));
    edits.extend(append_child(
        xml,
        &xfs,
        &format!(
            r#"<{p}xf numFmtId="0" fontId="{font}" fillId="{fill}" borderId="0" xfId="0" applyFont="1" applyFill="1" applyAlignment="1"><{p}alignment horizontal="center" vertical="center"/></{p}xf>"#,
            p = p,
            font = font_id,
            fill = fill_id
        ),
    ));

    let index = u32::try_from(xf_id)
        .map_err(|_| SheetError::Malformed("too many cell styles".to_string()))?;
    Ok((apply_edits(xml, edits), index))
}

/// Replace `sheetData` of a worksheet part, keeping every other element.
/// The `dimension` hint is dropped since it may no longer match.
fn splice_sheet_data(raw: &str, sheet: &Worksheet, header_style: u32) -> Result<String, SheetError> {
    let doc = roxmltree::Document::parse(raw)?;
    let root = doc.root_element();
    let data = root
        .children()
        .find(|n| n.tag_name().name() == "sheetData")
        .ok_or_else(|| SheetError::Malformed(format!("sheet '{}' has no <sheetData>", sheet.name)))?;
    let prefix = prefix_of(&raw[data.range()]);

    let mut edits = vec![Edit {
        range: data.range(),
        text: sheet_data_xml(sheet, header_style, true, &prefix),
    }];
    if let Some(dimension) = root.children().find(|n| n.tag_name().name() == "dimension") {
        edits.push(Edit::remove(dimension.range()));
    }
    Ok(apply_edits(raw, edits))
}

// ---------------------------------------------------------------------------
// Text edits on XML parts
// ---------------------------------------------------------------------------

/// Replacement of a byte range of a part's text.
struct Edit {
    range: Range<usize>,
    text: String,
}

impl Edit {
    fn remove(range: Range<usize>) -> Self {
        Self {
            range,
            text: String::new(),
        }
    }
}

/// Apply non-overlapping edits. At a shared start offset the longer range is
/// replaced before text is inserted in front of it.
fn apply_edits(xml: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|e| (Reverse(e.range.start), Reverse(e.range.end)));
    let mut out = xml.to_string();
    for edit in edits {
        out.replace_range(edit.range, &edit.text);
    }
    out
}

/// Qualified name of the element whose markup starts `tag`.
fn qualified_name(tag: &str) -> &str {
    tag.get(1..)
        .and_then(|rest| {
            rest.split(|c: char| c.is_whitespace() || c == '/' || c == '>')
                .next()
        })
        .unwrap_or_default()
}

/// Namespace prefix of an element including the colon, or empty.
fn prefix_of(tag: &str) -> String {
    match qualified_name(tag).split_once(':') {
        Some((prefix, _)) => format!("{}:", prefix),
        None => String::new(),
    }
}

/// Byte length of the start tag at the beginning of `text`.
fn start_tag_len(text: &str) -> usize {
    let mut quote = None;
    for (idx, c) in text.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '>') => return idx + 1,
            _ => {}
        }
    }
    text.len()
}

fn start_tag_range(xml: &str, node: &roxmltree::Node) -> Range<usize> {
    let range = node.range();
    range.start..range.start + start_tag_len(&xml[range])
}

/// Range of the value of attribute `name` inside a start tag.
fn find_attribute(tag: &str, name: &str) -> Option<Range<usize>> {
    let bytes = tag.as_bytes();
    let skip_space = |mut i: usize| {
        while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
            i += 1;
        }
        i
    };

    let mut i = 1 + qualified_name(tag).len();
    loop {
        i = skip_space(i);
        let start = i;
        while bytes
            .get(i)
            .is_some_and(|b| !b.is_ascii_whitespace() && !matches!(*b, b'=' | b'/' | b'>'))
        {
            i += 1;
        }
        if i == start {
            return None;
        }
        let attribute = &tag[start..i];
        i = skip_space(i);
        if bytes.get(i) != Some(&b'=') {
            return None;
        }
        i = skip_space(i + 1);
        let quote = *bytes.get(i)?;
        if quote != b'"' && quote != b'\'' {
            return None;
        }
        let value_start = i + 1;
        let value_end = value_start + tag.get(value_start..)?.find(quote as char)?;
        if attribute == name {
            return Some(value_start..value_end);
        }
        i = value_end + 1;
    }
}

fn with_attribute(tag: &str, name: &str, value: &str) -> String {
    let value = escape_xml(value);
    match find_attribute(tag, name) {
        Some(range) => {
            let mut out = tag.to_string();
            out.replace_range(range, &value);
            out
        }
        None => {
            let at = 1 + qualified_name(tag).len();
            format!(r#"{} {}="{}"{}"#, &tag[..at], name, value, &tag[at..])
        }
    }
}

fn set_attribute(xml: &str, node: &roxmltree::Node, name: &str, value: &str) -> Edit {
    let range = start_tag_range(xml, node);
    let text = with_attribute(&xml[range.clone()], name, value);
    Edit { range, text }
}

/// Insert `child` as the last child of `node`, keeping a `count` attribute
/// in step.
fn append_child(xml: &str, node: &roxmltree::Node, child: &str) -> Vec<Edit> {
    let tag_range = start_tag_range(xml, node);
    let tag = &xml[tag_range.clone()];
    let self_closing = tag.ends_with("/>");

    let mut open = if self_closing {
        format!("{}>", tag[..tag.len() - 2].trim_end())
    } else {
        tag.to_string()
    };
    if node.attribute("count").is_some() {
        let count = node.children().filter(|n| n.is_element()).count() + 1;
        open = with_attribute(&open, "count", &count.to_string());
    }

    if self_closing {
        return vec![Edit {
            range: node.range(),
            text: format!("{}{}</{}>", open, child, qualified_name(tag)),
        }];
    }

    let end = node.range().end;
    let close = xml[..end].rfind("</").unwrap_or(end);
    let mut edits = vec![Edit {
        range: close..close,
        text: child.to_string(),
    }];
    if open != tag {
        edits.push(Edit {
            range: tag_range,
            text: open,
        });
    }
    edits
}

/// Append the markup built by `child` (given the parent's prefix) to the
/// first element named `parent`.
fn append_to<F>(xml: &str, parent: &str, child: F) -> Result<String, SheetError>
where
    F: FnOnce(&str) -> String,
{
    let doc = roxmltree::Document::parse(xml)?;
    let node = doc
        .descendants()
        .find(|n| n.tag_name().name() == parent)
        .ok_or_else(|| SheetError::Malformed(format!("no <{}> element", parent)))?;
    let prefix = prefix_of(&xml[node.range()]);
    let edits = append_child(xml, &node, &child(&prefix));
    Ok(apply_edits(xml, edits))
}

// ---------------------------------------------------------------------------
// New packages
// ---------------------------------------------------------------------------

fn new_package(workbook: &Workbook) -> Vec<(String, Vec<u8>)> {
    let count = workbook.sheets.len();
    let mut parts: Vec<(String, Vec<u8>)> = vec![
        (CONTENT_TYPES.to_string(), content_types(count).into_bytes()),
        ("_rels/.rels".to_string(), root_rels().into_bytes()),
        (WORKBOOK_PART.to_string(), workbook_xml(workbook).into_bytes()),
        (WORKBOOK_RELS.to_string(), workbook_rels(count).into_bytes()),
        ("xl/styles.xml".to_string(), styles_xml().into_bytes()),
    ];
    for (idx, sheet) in workbook.sheets.iter().enumerate() {
        // Cell styles refer to a stylesheet this package does not carry.
        parts.push((
            format!("xl/worksheets/sheet{}.xml", idx + 1),
            sheet_xml(sheet, 1, false).into_bytes(),
        ));
    }
    parts
}

fn content_types(sheet_count: usize) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="{}"/>"#,
        CT_STYLES
    );
    for idx in 1..=sheet_count {
        xml.push_str(&format!(
            r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="{}"/>"#,
            idx, CT_WORKSHEET
        ));
    }
    xml.push_str("</Types>");
    xml
}

fn root_rels() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="{}" Target="xl/workbook.xml"/></Relationships>"#,
        REL_OFFICE_DOC
    )
}

fn workbook_xml(workbook: &Workbook) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="{}" xmlns:r="{}"><bookViews><workbookView activeTab="{}"/></bookViews><sheets>"#,
        NS_MAIN, NS_REL, workbook.active
    );
    for (idx, sheet) in workbook.sheets.iter().enumerate() {
        xml.push_str(&format!(
            r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
            escape_xml(&sheet.name),
            idx + 1,
            idx + 1
        ));
    }
    xml.push_str("</sheets></workbook>");
    xml
}

fn workbook_rels(sheet_count: usize) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for idx in 1..=sheet_count {
        xml.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="{}" Target="worksheets/sheet{}.xml"/>"#,
            idx, REL_WORKSHEET, idx
        ));
    }
    xml.push_str(&format!(
        r#"<Relationship Id="rId{}" Type="{}" Target="styles.xml"/></Relationships>"#,
        sheet_count + 1,
        REL_STYLES
    ));
    xml
}

/// Style index 0 is the default, 1 is the header style.
fn styles_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="{}"><fonts count="2"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><color rgb="{}"/><name val="Calibri"/></font></fonts><fills count="3"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill><fill><patternFill patternType="solid"><fgColor rgb="{}"/><bgColor rgb="{}"/></patternFill></fill></fills><borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="1" fillId="2" borderId="0" xfId="0" applyFont="1" applyFill="1" applyAlignment="1"><alignment horizontal="center" vertical="center"/></xf></cellXfs><cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles></styleSheet>"#,
        NS_MAIN, HEADER_FONT_RGB, HEADER_FILL_RGB, HEADER_FILL_RGB
    )
}

fn sheet_xml(sheet: &Worksheet, header_style: u32, keep_styles: bool) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="{}">{}</worksheet>"#,
        NS_MAIN,
        sheet_data_xml(sheet, header_style, keep_styles, "")
    )
}

fn sheet_data_xml(sheet: &Worksheet, header_style: u32, keep_styles: bool, p: &str) -> String {
    let styles = |row: u32| -> BTreeSet<u32> {
        if !keep_styles {
            return BTreeSet::new();
        }
        sheet
            .cell_styles
            .range((row, 0)..=(row, u32::MAX))
            .map(|((_, col), _)| *col)
            .collect()
    };

    // Styled rows and cells may have no values yet; they still need elements.
    let mut row_indices: BTreeSet<u32> = sheet.rows.keys().copied().collect();
    row_indices.extend(sheet.header_style_rows.iter().copied());
    row_indices.extend(sheet.row_attributes.keys().copied());
    row_indices.extend(sheet.formulas.keys().map(|(row, _)| *row));
    if keep_styles {
        row_indices.extend(sheet.cell_styles.keys().map(|(row, _)| *row));
    }

    let mut xml = format!("<{}sheetData>", p);
    for row in row_indices {
        let header = sheet.header_style_rows.contains(&row);
        let mut attributes = sheet.row_attributes.get(&row).cloned().unwrap_or_default();
        if header || !keep_styles {
            attributes.retain(|(name, _)| name != "s" && name != "customFormat");
        }
        if header {
            attributes.push(("s".to_string(), header_style.to_string()));
            attributes.push(("customFormat".to_string(), "1".to_string()));
        }

        xml.push_str(&format!(r#"<{}row r="{}""#, p, row));
        for (name, value) in &attributes {
            xml.push_str(&format!(r#" {}="{}""#, name, escape_xml(value)));
        }
        xml.push('>');

        let mut columns: BTreeSet<u32> = sheet
            .rows
            .get(&row)
            .map(|cells| cells.keys().copied().collect())
            .unwrap_or_default();
        columns.extend(styles(row));
        columns.extend(
            sheet
                .formulas
                .range((row, 0)..=(row, u32::MAX))
                .map(|((_, col), _)| *col),
        );

        for col in columns {
            let style = if header {
                Some(header_style)
            } else if keep_styles {
                sheet.style(row, col)
            } else {
                None
            };
            push_cell(
                &mut xml,
                p,
                CellAddress::new(row, col),
                sheet.cell(row, col),
                style,
                sheet.formula(row, col),
            );
        }
        xml.push_str(&format!("</{}row>", p));
    }
    xml.push_str(&format!("</{}sheetData>", p));
    xml
}

fn formula_xml(p: &str, formula: &Formula) -> String {
    let mut xml = format!("<{}f", p);
    for (name, value) in &formula.attributes {
        xml.push_str(&format!(r#" {}="{}""#, name, escape_xml(value)));
    }
    if formula.text.is_empty() {
        xml.push_str("/>");
    } else {
        xml.push_str(&format!(">{}</{}f>", escape_xml(&formula.text), p));
    }
    xml
}

fn push_cell(
    xml: &mut String,
    p: &str,
    address: CellAddress,
    value: Option<&CellValue>,
    style: Option<u32>,
    formula: Option<&Formula>,
) {
    let style = match style {
        Some(s) if s != 0 => format!(r#" s="{}""#, s),
        _ => String::new(),
    };
    let f = formula.map(|f| formula_xml(p, f)).unwrap_or_default();

    match value {
        // A formula's cached text result is a plain string value.
        Some(CellValue::Text(text)) if formula.is_some() => xml.push_str(&format!(
            r#"<{p}c r="{a}"{s} t="str">{f}<{p}v>{v}</{p}v></{p}c>"#,
            p = p,
            a = address,
            s = style,
            f = f,
            v = escape_xml(text)
        )),
        Some(CellValue::Text(text)) => {
            let space = if text.trim() != text { r#" xml:space="preserve""# } else { "" };
            xml.push_str(&format!(
                r#"<{p}c r="{a}"{s} t="inlineStr"><{p}is><{p}t{sp}>{v}</{p}t></{p}is></{p}c>"#,
                p = p,
                a = address,
                s = style,
                sp = space,
                v = escape_xml(text)
            ));
        }
        Some(CellValue::Number(n)) if n.is_finite() => xml.push_str(&format!(
            r#"<{p}c r="{a}"{s}>{f}<{p}v>{n}</{p}v></{p}c>"#,
            p = p,
            a = address,
            s = style,
            f = f,
            n = n
        )),
        Some(CellValue::Bool(b)) => xml.push_str(&format!(
            r#"<{p}c r="{a}"{s} t="b">{f}<{p}v>{v}</{p}v></{p}c>"#,
            p = p,
            a = address,
            s = style,
            f = f,
            v = u8::from(*b)
        )),
        _ if f.is_empty() => xml.push_str(&format!(r#"<{}c r="{}"{}/>"#, p, address, style)),
        _ => xml.push_str(&format!(r#"<{p}c r="{a}"{s}>{f}</{p}c>"#, p = p, a = address, s = style, f = f)),
    }
}

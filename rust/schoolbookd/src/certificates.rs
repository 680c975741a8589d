use crate::layout::{self, Font, ParagraphStyle, Span};
use crate::pdf::{self, ImageId, Page, PdfDocument, PAGE_HEIGHT, PAGE_WIDTH};
use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};

const LOGO_HEIGHT: f64 = 54.0;
const SIGNATURE_HEIGHT: f64 = 48.0;
const MONTHS_ES: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

#[derive(Debug, Clone, Default)]
pub struct Institution {
    pub school_name: String,
    pub school_code: String,
    pub city: String,
    pub state: String,
    pub director_name: String,
    pub director_id_number: String,
    pub logo_path: Option<PathBuf>,
    pub secondary_logo_path: Option<PathBuf>,
    pub signature_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReportStyle {
    pub font_size: f64,
    pub margin: f64,
    pub line_spacing: f64,
    pub first_line_indent: f64,
}

impl ReportStyle {
    fn line_height(&self) -> f64 {
        self.font_size * self.line_spacing
    }

    fn column_width(&self) -> f64 {
        PAGE_WIDTH - 2.0 * self.margin
    }
}

#[derive(Debug)]
pub enum AssetProblem {
    Missing(PathBuf),
    Unsupported(PathBuf, String),
}

impl AssetProblem {
    pub fn code(&self) -> &'static str {
        match self {
            AssetProblem::Missing(_) => "asset_missing",
            AssetProblem::Unsupported(..) => "asset_unsupported",
        }
    }

    pub fn message(&self) -> String {
        match self {
            AssetProblem::Missing(p) => format!("asset not found: {}", p.to_string_lossy()),
            AssetProblem::Unsupported(p, why) => {
                format!("asset {} is not usable: {}", p.to_string_lossy(), why)
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Assets {
    logo: Option<ImageId>,
    secondary_logo: Option<ImageId>,
    signature: Option<ImageId>,
}

fn load_asset(doc: &mut PdfDocument, path: Option<&Path>) -> Result<Option<ImageId>, AssetProblem> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !path.is_file() {
        return Err(AssetProblem::Missing(path.to_path_buf()));
    }
    let image = pdf::load_jpeg(path)
        .map_err(|e| AssetProblem::Unsupported(path.to_path_buf(), format!("{:#}", e)))?;
    Ok(Some(doc.add_image(image)))
}

fn load_assets(doc: &mut PdfDocument, inst: &Institution) -> Result<Assets, AssetProblem> {
    Ok(Assets {
        logo: load_asset(doc, inst.logo_path.as_deref())?,
        secondary_logo: load_asset(doc, inst.secondary_logo_path.as_deref())?,
        signature: load_asset(doc, inst.signature_path.as_deref())?,
    })
}

/// "19 de octubre de 2026"
pub fn long_date_es(d: NaiveDate) -> String {
    format!(
        "{} de {} de {}",
        d.day(),
        MONTHS_ES[d.month0() as usize],
        d.year()
    )
}

pub struct Certificate {
    pub title: String,
    pub paragraphs: Vec<Vec<Span>>,
    pub signer_name: String,
    pub signer_role: String,
}

pub struct StudentCertificateData {
    pub full_name: String,
    pub id_label: String,
    pub level: String,
    pub section_label: String,
    pub period_name: String,
    pub issued_on: NaiveDate,
}

pub struct TeacherCertificateData {
    pub full_name: String,
    pub id_label: String,
    pub specialty: Option<String>,
    pub hired_at: Option<NaiveDate>,
    pub subjects: Vec<String>,
    pub issued_on: NaiveDate,
}

fn issued_paragraph(inst: &Institution, issued_on: NaiveDate) -> Vec<Span> {
    vec![Span::plain(format!(
        "Constancia que se expide a solicitud de la parte interesada en {}, a los {}.",
        inst.city,
        long_date_es(issued_on)
    ))]
}

fn director_intro(inst: &Institution) -> Vec<Span> {
    vec![
        Span::plain("Quien suscribe, "),
        Span::underlined(inst.director_name.clone()),
        Span::plain(format!(
            ", titular de la cédula de identidad N° {}, en su carácter de Director(a) de la {}, código {}, hace constar por medio de la presente que ",
            inst.director_id_number, inst.school_name, inst.school_code
        )),
    ]
}

pub fn study_certificate(inst: &Institution, data: &StudentCertificateData) -> Certificate {
    let mut body = director_intro(inst);
    body.push(Span::plain("el (la) estudiante "));
    body.push(Span::underlined(data.full_name.clone()));
    body.push(Span::plain(", titular de la cédula "));
    body.push(Span::underlined(data.id_label.clone()));
    body.push(Span::plain(format!(
        ", cursa estudios regulares de {} sección \"{}\" en esta institución durante el año escolar {}.",
        data.level, data.section_label, data.period_name
    )));

    Certificate {
        title: "CONSTANCIA DE ESTUDIO".to_string(),
        paragraphs: vec![body, issued_paragraph(inst, data.issued_on)],
        signer_name: inst.director_name.clone(),
        signer_role: "Director(a)".to_string(),
    }
}

pub fn work_certificate(inst: &Institution, data: &TeacherCertificateData) -> Certificate {
    let mut body = director_intro(inst);
    body.push(Span::plain("el (la) ciudadano(a) "));
    body.push(Span::underlined(data.full_name.clone()));
    body.push(Span::plain(", titular de la cédula "));
    body.push(Span::underlined(data.id_label.clone()));
    body.push(Span::plain(", presta sus servicios como docente en esta institución"));
    if let Some(hired) = data.hired_at {
        body.push(Span::plain(format!(" desde el {}", long_date_es(hired))));
    }
    if let Some(spec) = data.specialty.as_ref().filter(|s| !s.is_empty()) {
        body.push(Span::plain(format!(", en la especialidad de {}", spec)));
    }
    body.push(Span::plain("."));

    let mut paragraphs = vec![body];
    if !data.subjects.is_empty() {
        paragraphs.push(vec![Span::plain(format!(
            "Actualmente tiene a su cargo: {}.",
            data.subjects.join(", ")
        ))]);
    }
    paragraphs.push(issued_paragraph(inst, data.issued_on));

    Certificate {
        title: "CONSTANCIA DE TRABAJO".to_string(),
        paragraphs,
        signer_name: inst.director_name.clone(),
        signer_role: "Director(a)".to_string(),
    }
}

/// Draws the letterhead and returns the y coordinate where content starts.
fn letterhead(page: &mut Page, doc_assets: &Assets, sizes: &ImageSizes, inst: &Institution, style: &ReportStyle) -> f64 {
    let top = PAGE_HEIGHT - style.margin;
    if let (Some(id), Some((w, h))) = (doc_assets.logo, sizes.logo) {
        let width = LOGO_HEIGHT * w as f64 / h as f64;
        page.image(id, style.margin, top - LOGO_HEIGHT, width, LOGO_HEIGHT);
    }
    if let (Some(id), Some((w, h))) = (doc_assets.secondary_logo, sizes.secondary_logo) {
        let width = LOGO_HEIGHT * w as f64 / h as f64;
        page.image(
            id,
            PAGE_WIDTH - style.margin - width,
            top - LOGO_HEIGHT,
            width,
            LOGO_HEIGHT,
        );
    }

    let mut y = top - style.font_size;
    let header_lines = [
        inst.school_name.clone(),
        format!("Código: {}", inst.school_code),
        format!("{} - {}", inst.city, inst.state),
    ];
    for (i, text) in header_lines.iter().enumerate() {
        let font = if i == 0 { Font::HelveticaBold } else { Font::Helvetica };
        let x = layout::centered_x(font, style.font_size, text, PAGE_WIDTH);
        page.text(font, style.font_size, x, y, text);
        y -= style.line_height();
    }
    (top - LOGO_HEIGHT).min(y) - style.line_height()
}

#[derive(Debug, Default, Clone, Copy)]
struct ImageSizes {
    logo: Option<(u32, u32)>,
    secondary_logo: Option<(u32, u32)>,
    signature: Option<(u32, u32)>,
}

fn image_sizes(doc: &PdfDocument, assets: &Assets) -> ImageSizes {
    ImageSizes {
        logo: assets.logo.map(|id| doc.image_size(id)),
        secondary_logo: assets.secondary_logo.map(|id| doc.image_size(id)),
        signature: assets.signature.map(|id| doc.image_size(id)),
    }
}

fn draw_lines(page: &mut Page, lines: &[layout::Line], style: &ReportStyle, y: &mut f64) {
    for line in lines {
        for frag in &line.fragments {
            let x = style.margin + frag.x;
            page.text(Font::Helvetica, style.font_size, x, *y, &frag.text);
            if frag.underline {
                page.line(x, *y - 1.5, x + frag.width, *y - 1.5, 0.6);
            }
        }
        *y -= style.line_height();
    }
}

pub fn render_certificate(
    inst: &Institution,
    style: &ReportStyle,
    cert: &Certificate,
) -> Result<PdfDocument, AssetProblem> {
    let mut doc = PdfDocument::new();
    let assets = load_assets(&mut doc, inst)?;
    let sizes = image_sizes(&doc, &assets);
    let bottom = style.margin;

    let para_style = ParagraphStyle {
        font: Font::Helvetica,
        size: style.font_size,
        width: style.column_width(),
        first_line_indent: style.first_line_indent,
    };
    let laid_out: Vec<Vec<layout::Line>> = cert
        .paragraphs
        .iter()
        .map(|p| layout::layout_paragraph(p, &para_style))
        .collect();

    let lines: Vec<(layout::Line, bool)> = laid_out
        .into_iter()
        .flat_map(|para| {
            let n = para.len();
            para.into_iter()
                .enumerate()
                .map(move |(i, line)| (line, i + 1 == n))
        })
        .collect();

    let title_size = style.font_size + 4.0;
    let mut idx = 0usize;
    let mut first_page = true;
    loop {
        let page = doc.new_page();
        let mut y = if first_page {
            let mut y = letterhead(page, &assets, &sizes, inst, style) - style.line_height();
            let x = layout::centered_x(Font::HelveticaBold, title_size, &cert.title, PAGE_WIDTH);
            page.text(Font::HelveticaBold, title_size, x, y, &cert.title);
            y -= 3.0 * style.line_height();
            y
        } else {
            PAGE_HEIGHT - style.margin - style.font_size
        };
        first_page = false;

        while idx < lines.len() && y >= bottom + style.line_height() {
            let (line, ends_paragraph) = &lines[idx];
            draw_lines(page, std::slice::from_ref(line), style, &mut y);
            if *ends_paragraph {
                y -= style.line_height();
            }
            idx += 1;
        }
        if idx < lines.len() {
            continue;
        }

        if y - SIGNATURE_HEIGHT - 4.0 * style.line_height() > bottom {
            signature_block(page, &assets, &sizes, cert, style, y);
        } else {
            let page = doc.new_page();
            let top = PAGE_HEIGHT - style.margin - style.font_size;
            signature_block(page, &assets, &sizes, cert, style, top);
        }
        break;
    }
    Ok(doc)
}

fn signature_block(
    page: &mut Page,
    assets: &Assets,
    sizes: &ImageSizes,
    cert: &Certificate,
    style: &ReportStyle,
    y: f64,
) {
    let rule_width = 180.0;
    let rule_x = (PAGE_WIDTH - rule_width) / 2.0;
    let mut y = y - style.line_height();
    if let (Some(id), Some((w, h))) = (assets.signature, sizes.signature) {
        let width = SIGNATURE_HEIGHT * w as f64 / h as f64;
        page.image(id, (PAGE_WIDTH - width) / 2.0, y - SIGNATURE_HEIGHT, width, SIGNATURE_HEIGHT);
    }
    y -= SIGNATURE_HEIGHT + 4.0;
    page.line(rule_x, y, rule_x + rule_width, y, 0.8);
    y -= style.line_height();
    for (font, text) in [
        (Font::HelveticaBold, cert.signer_name.as_str()),
        (Font::Helvetica, cert.signer_role.as_str()),
    ] {
        let x = layout::centered_x(font, style.font_size, text, PAGE_WIDTH);
        page.text(font, style.font_size, x, y, text);
        y -= style.line_height();
    }
}

pub struct TableColumn {
    pub header: String,
    pub width: f64,
}

pub struct TableReport {
    pub title: String,
    pub subtitle_lines: Vec<String>,
    pub columns: Vec<TableColumn>,
    pub rows: Vec<Vec<String>>,
}

/// Paginated table with the letterhead on every page and repeated column
/// headers. Cells are truncated to their column width.
pub fn render_table(
    inst: &Institution,
    style: &ReportStyle,
    report: &TableReport,
) -> Result<PdfDocument, AssetProblem> {
    let mut doc = PdfDocument::new();
    let assets = load_assets(&mut doc, inst)?;
    let sizes = image_sizes(&doc, &assets);
    let row_height = style.line_height() + 2.0;
    let cell_pad = 3.0;
    let table_width: f64 = report.columns.iter().map(|c| c.width).sum();
    let bottom = style.margin + row_height;

    let mut next_row = 0usize;
    let mut page_no = 0usize;
    loop {
        page_no += 1;
        let page = doc.new_page();
        let mut y = letterhead(page, &assets, &sizes, inst, style);

        let x = layout::centered_x(Font::HelveticaBold, style.font_size + 2.0, &report.title, PAGE_WIDTH);
        page.text(Font::HelveticaBold, style.font_size + 2.0, x, y, &report.title);
        y -= style.line_height() * 1.5;
        for sub in &report.subtitle_lines {
            page.text(Font::Helvetica, style.font_size, style.margin, y, sub);
            y -= style.line_height();
        }
        y -= style.line_height() / 2.0;

        draw_row(page, style, &report.columns, None, y, row_height, cell_pad, Font::HelveticaBold);
        y -= row_height;

        while next_row < report.rows.len() && y - row_height >= bottom {
            draw_row(
                page,
                style,
                &report.columns,
                Some(&report.rows[next_row]),
                y,
                row_height,
                cell_pad,
                Font::Helvetica,
            );
            y -= row_height;
            next_row += 1;
        }
        page.line(style.margin, y, style.margin + table_width, y, 0.6);

        let footer = format!("Página {}", page_no);
        let fx = PAGE_WIDTH - style.margin - layout::text_width(Font::Helvetica, style.font_size - 2.0, &footer);
        page.text(Font::Helvetica, style.font_size - 2.0, fx, style.margin / 2.0, &footer);

        if next_row >= report.rows.len() {
            break;
        }
    }
    Ok(doc)
}

#[allow(clippy::too_many_arguments)]
fn draw_row(
    page: &mut Page,
    style: &ReportStyle,
    columns: &[TableColumn],
    cells: Option<&Vec<String>>,
    y: f64,
    row_height: f64,
    pad: f64,
    font: Font,
) {
    let mut x = style.margin;
    for (i, col) in columns.iter().enumerate() {
        page.rect(x, y - row_height, col.width, row_height, 0.4);
        let raw = match cells {
            Some(c) => c.get(i).map(String::as_str).unwrap_or(""),
            None => col.header.as_str(),
        };
        let text = layout::fit_text(font, style.font_size, raw, col.width - 2.0 * pad);
        page.text(font, style.font_size, x + pad, y - row_height + pad + 1.0, &text);
        x += col.width;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn style() -> ReportStyle {
        ReportStyle {
            font_size: 11.0,
            margin: 72.0,
            line_spacing: 1.5,
            first_line_indent: 36.0,
        }
    }

    fn institution() -> Institution {
        Institution {
            school_name: "U.E. SIMÓN RODRÍGUEZ".to_string(),
            school_code: "OD1234".to_string(),
            city: "Caracas".to_string(),
            state: "Distrito Capital".to_string(),
            director_name: "JOSÉ LÓPEZ".to_string(),
            director_id_number: "V-5000000".to_string(),
            ..Institution::default()
        }
    }

    #[test]
    fn long_date_uses_spanish_month_names() {
        let d = NaiveDate::from_ymd_opt(2026, 10, 19).expect("date");
        assert_eq!(long_date_es(d), "19 de octubre de 2026");
    }

    #[test]
    fn study_certificate_names_the_section_and_period() {
        let data = StudentCertificateData {
            full_name: "LUIS ROJAS".to_string(),
            id_label: "V-30111222".to_string(),
            level: "1ER AÑO".to_string(),
            section_label: "A".to_string(),
            period_name: "2025-2026".to_string(),
            issued_on: NaiveDate::from_ymd_opt(2025, 11, 3).expect("date"),
        };
        let cert = study_certificate(&institution(), &data);
        let text: String = cert.paragraphs[0].iter().map(|s| s.text.as_str()).collect();
        assert!(text.contains("1ER AÑO sección \"A\""));
        assert!(text.contains("2025-2026"));
        assert!(cert.paragraphs[0].iter().any(|s| s.underline && s.text == "LUIS ROJAS"));

        let doc = render_certificate(&institution(), &style(), &cert).expect("render");
        assert_eq!(doc.page_count(), 1);
        assert!(doc.to_bytes().starts_with(b"%PDF-"));
    }

    #[test]
    fn missing_logo_is_reported_before_rendering() {
        let inst = Institution {
            logo_path: Some(PathBuf::from("/definitely/not/here/logo.jpg")),
            ..institution()
        };
        let cert = Certificate {
            title: "X".to_string(),
            paragraphs: vec![vec![Span::plain("hola")]],
            signer_name: String::new(),
            signer_role: String::new(),
        };
        match render_certificate(&inst, &style(), &cert) {
            Err(p) => assert_eq!(p.code(), "asset_missing"),
            Ok(_) => panic!("expected asset_missing"),
        }
    }

    #[test]
    fn long_tables_spill_onto_more_pages() {
        let report = TableReport {
            title: "LISTA".to_string(),
            subtitle_lines: vec![],
            columns: vec![
                TableColumn { header: "N°".to_string(), width: 40.0 },
                TableColumn { header: "Nombre".to_string(), width: 300.0 },
            ],
            rows: (1..=120).map(|i| vec![i.to_string(), format!("ESTUDIANTE {}", i)]).collect(),
        };
        let doc = render_table(&institution(), &style(), &report).expect("render");
        assert!(doc.page_count() > 1);
    }
}

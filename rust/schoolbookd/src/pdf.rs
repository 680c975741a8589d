//! Minimal PDF 1.4 writer: standard Helvetica faces, text, rules and
//! embedded JPEG images (passed through with DCTDecode).

use crate::layout::Font;
use anyhow::{anyhow, Context};
use std::io::Write;
use std::path::Path;

pub const PAGE_WIDTH: f64 = 612.0;
pub const PAGE_HEIGHT: f64 = 792.0;

#[derive(Debug, Clone)]
pub struct JpegImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub components: u8,
}

/// Reads the frame header of a baseline or progressive JPEG.
pub fn parse_jpeg(data: Vec<u8>) -> anyhow::Result<JpegImage> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return Err(anyhow!("not a JPEG file"));
    }
    let mut i = 2usize;
    while i + 3 < data.len() {
        if data[i] != 0xFF {
            return Err(anyhow!("corrupt JPEG marker at byte {}", i));
        }
        let marker = data[i + 1];
        if marker == 0xFF {
            i += 1;
            continue;
        }
        if marker == 0x01 || (0xD0..=0xD9).contains(&marker) {
            i += 2;
            continue;
        }
        let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            if i + 9 >= data.len() {
                return Err(anyhow!("truncated JPEG frame header"));
            }
            let height = u16::from_be_bytes([data[i + 5], data[i + 6]]) as u32;
            let width = u16::from_be_bytes([data[i + 7], data[i + 8]]) as u32;
            let components = data[i + 9];
            if width == 0 || height == 0 {
                return Err(anyhow!("JPEG has zero dimensions"));
            }
            return Ok(JpegImage {
                data,
                width,
                height,
                components,
            });
        }
        i += 2 + len;
    }
    Err(anyhow!("JPEG frame header not found"))
}

pub fn load_jpeg(path: &Path) -> anyhow::Result<JpegImage> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read image {}", path.to_string_lossy()))?;
    parse_jpeg(data).with_context(|| format!("unsupported image {}", path.to_string_lossy()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageId(usize);

#[derive(Debug, Default)]
pub struct Page {
    content: Vec<u8>,
}

impl Page {
    pub fn text(&mut self, font: Font, size: f64, x: f64, y: f64, text: &str) {
        let _ = write!(
            self.content,
            "BT /{} {} Tf {} {} Td (",
            font.resource(),
            num(size),
            num(x),
            num(y)
        );
        self.content.extend(encode_text(text));
        self.content.extend_from_slice(b") Tj ET\n");
    }

    pub fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, width: f64) {
        let _ = writeln!(
            self.content,
            "{} w {} {} m {} {} l S",
            num(width),
            num(x1),
            num(y1),
            num(x2),
            num(y2)
        );
    }

    pub fn rect(&mut self, x: f64, y: f64, w: f64, h: f64, width: f64) {
        let _ = writeln!(
            self.content,
            "{} w {} {} {} {} re S",
            num(width),
            num(x),
            num(y),
            num(w),
            num(h)
        );
    }

    pub fn image(&mut self, id: ImageId, x: f64, y: f64, w: f64, h: f64) {
        let _ = writeln!(
            self.content,
            "q {} 0 0 {} {} {} cm /Im{} Do Q",
            num(w),
            num(h),
            num(x),
            num(y),
            id.0
        );
    }
}

#[derive(Debug, Default)]
pub struct PdfDocument {
    pages: Vec<Page>,
    images: Vec<JpegImage>,
}

impl PdfDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, image: JpegImage) -> ImageId {
        self.images.push(image);
        ImageId(self.images.len() - 1)
    }

    pub fn image_size(&self, id: ImageId) -> (u32, u32) {
        let img = &self.images[id.0];
        (img.width, img.height)
    }

    pub fn new_page(&mut self) -> &mut Page {
        self.pages.push(Page::default());
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // 1 catalog, 2 page tree, 3-4 fonts, then images, then page/content pairs.
        let first_image = 5;
        let first_page = first_image + self.images.len();
        let object_count = first_page - 1 + 2 * self.pages.len();

        let mut out: Vec<u8> = Vec::new();
        let mut offsets: Vec<usize> = Vec::with_capacity(object_count);
        out.extend_from_slice(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");

        let mut begin = |out: &mut Vec<u8>, n: usize| {
            offsets.push(out.len());
            let _ = writeln!(out, "{} 0 obj", n);
        };

        begin(&mut out, 1);
        out.extend_from_slice(b"<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");

        begin(&mut out, 2);
        let kids: Vec<String> = (0..self.pages.len())
            .map(|p| format!("{} 0 R", first_page + 2 * p))
            .collect();
        let _ = write!(
            out,
            "<< /Type /Pages /Kids [{}] /Count {} >>\nendobj\n",
            kids.join(" "),
            self.pages.len()
        );

        for (n, font) in [(3, Font::Helvetica), (4, Font::HelveticaBold)] {
            begin(&mut out, n);
            let _ = write!(
                out,
                "<< /Type /Font /Subtype /Type1 /BaseFont /{} /Encoding /WinAnsiEncoding >>\nendobj\n",
                font.base_name()
            );
        }

        for (k, img) in self.images.iter().enumerate() {
            begin(&mut out, first_image + k);
            let color_space = match img.components {
                1 => "/DeviceGray",
                4 => "/DeviceCMYK",
                _ => "/DeviceRGB",
            };
            let _ = write!(
                out,
                "<< /Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace {} /BitsPerComponent 8 /Filter /DCTDecode /Length {} >>\nstream\n",
                img.width,
                img.height,
                color_space,
                img.data.len()
            );
            out.extend_from_slice(&img.data);
            out.extend_from_slice(b"\nendstream\nendobj\n");
        }

        let xobjects: Vec<String> = (0..self.images.len())
            .map(|k| format!("/Im{} {} 0 R", k, first_image + k))
            .collect();
        for (p, page) in self.pages.iter().enumerate() {
            let page_obj = first_page + 2 * p;
            begin(&mut out, page_obj);
            let _ = write!(
                out,
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] /Resources << /Font << /F1 3 0 R /F2 4 0 R >> /XObject << {} >> >> /Contents {} 0 R >>\nendobj\n",
                num(PAGE_WIDTH),
                num(PAGE_HEIGHT),
                xobjects.join(" "),
                page_obj + 1
            );
            begin(&mut out, page_obj + 1);
            let _ = write!(out, "<< /Length {} >>\nstream\n", page.content.len());
            out.extend_from_slice(&page.content);
            out.extend_from_slice(b"\nendstream\nendobj\n");
        }

        let xref_at = out.len();
        let _ = write!(out, "xref\n0 {}\n0000000000 65535 f \n", offsets.len() + 1);
        for off in &offsets {
            let _ = write!(out, "{:010} 00000 n \n", off);
        }
        let _ = write!(
            out,
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            offsets.len() + 1,
            xref_at
        );
        out
    }
}

/// WinAnsi bytes for a PDF literal string. Latin-1 maps one to one; anything
/// else becomes '?'.
fn encode_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        let b = if code <= 0xFF { code as u8 } else { b'?' };
        match b {
            b'(' | b')' | b'\\' => {
                out.push(b'\\');
                out.push(b);
            }
            b'\n' | b'\r' => out.push(b' '),
            _ => out.push(b),
        }
    }
    out
}

fn num(v: f64) -> String {
    let s = format!("{:.2}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" || s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut d = vec![0xFF, 0xD8];
        // APP0 segment to skip over.
        d.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x4A, 0x46]);
        d.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        d.extend_from_slice(&height.to_be_bytes());
        d.extend_from_slice(&width.to_be_bytes());
        d.extend_from_slice(&[0x03, 1, 0x11, 0, 2, 0x11, 1, 3, 0x11, 1]);
        d.extend_from_slice(&[0xFF, 0xD9]);
        d
    }

    #[test]
    fn jpeg_header_dimensions() {
        let img = parse_jpeg(tiny_jpeg(320, 96)).expect("parse");
        assert_eq!((img.width, img.height, img.components), (320, 96, 3));
    }

    #[test]
    fn non_jpeg_is_rejected() {
        assert!(parse_jpeg(b"\x89PNG\r\n\x1a\n0000".to_vec()).is_err());
        assert!(parse_jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9]).is_err());
    }

    #[test]
    fn text_is_escaped_and_latin1_encoded() {
        assert_eq!(encode_text("a(b)c\\"), b"a\\(b\\)c\\\\".to_vec());
        assert_eq!(encode_text("Año"), vec![b'A', 0xF1, b'o']);
        assert_eq!(encode_text("€"), vec![b'?']);
    }

    #[test]
    fn numbers_are_compact() {
        assert_eq!(num(12.0), "12");
        assert_eq!(num(12.5), "12.5");
        assert_eq!(num(0.004), "0");
        assert_eq!(num(-3.256), "-3.26");
    }

    #[test]
    fn xref_offsets_point_at_objects() {
        let mut doc = PdfDocument::new();
        let img = doc.add_image(parse_jpeg(tiny_jpeg(10, 10)).expect("jpeg"));
        let page = doc.new_page();
        page.text(Font::Helvetica, 12.0, 72.0, 700.0, "Constancia");
        page.image(img, 72.0, 720.0, 40.0, 40.0);
        let page = doc.new_page();
        page.line(72.0, 100.0, 300.0, 100.0, 0.5);
        let bytes = doc.to_bytes();

        assert!(bytes.starts_with(b"%PDF-1.4"));
        let text = String::from_utf8_lossy(&bytes).to_string();
        assert!(text.contains("/Count 2"));
        assert!(text.trim_end().ends_with("%%EOF"));

        let xref_at = text.find("xref\n").expect("xref");
        let entries: Vec<usize> = text[xref_at..]
            .lines()
            .skip(3)
            .take_while(|l| l.ends_with(" n "))
            .map(|l| l[..10].parse().expect("offset"))
            .collect();
        // catalog, pages, 2 fonts, 1 image, 2 x (page + content)
        assert_eq!(entries.len(), 9);
        for (i, off) in entries.iter().enumerate() {
            let expected = format!("{} 0 obj", i + 1);
            assert_eq!(&bytes[*off..*off + expected.len()], expected.as_bytes());
        }
    }
}

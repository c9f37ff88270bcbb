//! ePOS-Print XML for the printer poll response.
//!
//! The builder mirrors the printer's `epos-print` element set: text attribute
//! directives, text runs, feeds, raster images and a final cut. The envelope
//! (`PrintRequestInfo` / `ePOSPrint` / `Parameter` / `PrintData`) is added by
//! [`EposBuilder::build`].

use crate::job::KilnRequest;
use crate::photo::EncodedImage;
use chrono::DateTime;
use std::fmt::Write;

const EPOS_NAMESPACE: &str = "http://www.epson-pos.com/schemas/2011/03/epos-print";

/// Lines of blank paper left for a doodle when the request has no photo
const DOODLE_FEED_LINES: u32 = 10;

/// Text alignment
#[derive(Debug, Clone, Copy)]
pub enum Alignment {
    Left,
    Center,
    Right,
}

impl Alignment {
    fn as_str(&self) -> &'static str {
        match self {
            Alignment::Left => "left",
            Alignment::Center => "center",
            Alignment::Right => "right",
        }
    }
}

/// Font selection
#[derive(Debug, Clone, Copy)]
pub enum Font {
    A, // Standard (12x24)
    B, // Compressed (9x17)
}

impl Font {
    fn as_str(&self) -> &'static str {
        match self {
            Font::A => "font_a",
            Font::B => "font_b",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CutType {
    /// Feed to the cutter, then cut
    Feed,
    NoFeed,
}

impl CutType {
    fn as_str(&self) -> &'static str {
        match self {
            CutType::Feed => "feed",
            CutType::NoFeed => "no_feed",
        }
    }
}

/// Printer parameters for the envelope
#[derive(Debug, Clone)]
pub struct TicketOptions {
    /// Device id of the target printer as configured on the print server
    pub device_id: String,
    /// Print timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for TicketOptions {
    fn default() -> Self {
        Self {
            device_id: "local_printer".to_string(),
            timeout_ms: 10000,
        }
    }
}

/// ePOS-Print document builder
pub struct EposBuilder {
    body: String,
}

impl EposBuilder {
    pub fn new() -> Self {
        Self { body: String::new() }
    }

    fn element(&mut self, element: &str) -> &mut Self {
        self.body.push_str("        ");
        self.body.push_str(element);
        self.body.push('\n');
        self
    }

    pub fn lang(&mut self, lang: &str) -> &mut Self {
        let element = format!("<text lang=\"{}\"/>", escape_xml(lang));
        self.element(&element)
    }

    pub fn smooth(&mut self, enabled: bool) -> &mut Self {
        let element = format!("<text smooth=\"{}\"/>", enabled);
        self.element(&element)
    }

    pub fn align(&mut self, alignment: Alignment) -> &mut Self {
        let element = format!("<text align=\"{}\"/>", alignment.as_str());
        self.element(&element)
    }

    pub fn font(&mut self, font: Font) -> &mut Self {
        let element = format!("<text font=\"{}\"/>", font.as_str());
        self.element(&element)
    }

    /// Character scale, 1-8 in each direction
    pub fn size(&mut self, width: u8, height: u8) -> &mut Self {
        let element = format!(
            "<text width=\"{}\" height=\"{}\"/>",
            width.clamp(1, 8),
            height.clamp(1, 8)
        );
        self.element(&element)
    }

    /// Emphasis flags, always printed in the primary color
    pub fn style(&mut self, reverse: bool, underline: bool, emphasis: bool) -> &mut Self {
        let element = format!(
            "<text reverse=\"{}\" ul=\"{}\" em=\"{}\" color=\"color_1\"/>",
            reverse, underline, emphasis
        );
        self.element(&element)
    }

    /// Text run without a line break
    pub fn text(&mut self, text: &str) -> &mut Self {
        let element = format!("<text>{}</text>", escape_xml(text));
        self.element(&element)
    }

    /// Text run followed by a line break
    pub fn line(&mut self, text: &str) -> &mut Self {
        let element = format!("<text>{}&#10;</text>", escape_xml(text));
        self.element(&element)
    }

    /// Labeled field, e.g. `Cost: 12.50`
    pub fn field(&mut self, label: &str, value: &str) -> &mut Self {
        self.line(&format!("{}: {}", label, value))
    }

    /// Feed paper by `unit` dots
    pub fn feed_unit(&mut self, unit: u32) -> &mut Self {
        let element = format!("<feed unit=\"{}\"/>", unit);
        self.element(&element)
    }

    /// Feed paper by `lines` lines
    pub fn feed_lines(&mut self, lines: u32) -> &mut Self {
        let element = format!("<feed line=\"{}\"/>", lines);
        self.element(&element)
    }

    /// Monochrome raster image
    pub fn image(&mut self, image: &EncodedImage) -> &mut Self {
        let element = format!(
            "<image width=\"{}\" height=\"{}\" color=\"color_1\" mode=\"mono\">{}</image>",
            image.width, image.height, image.data
        );
        self.element(&element)
    }

    pub fn cut(&mut self, cut: CutType) -> &mut Self {
        let element = format!("<cut type=\"{}\"/>", cut.as_str());
        self.element(&element)
    }

    /// Wrap the directives in the print request envelope
    pub fn build(&self, options: &TicketOptions) -> String {
        let mut xml = String::with_capacity(self.body.len() + 512);

        xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        xml.push_str("<PrintRequestInfo>\n");
        xml.push_str("  <ePOSPrint>\n");
        xml.push_str("    <Parameter>\n");
        let _ = writeln!(xml, "      <devid>{}</devid>", escape_xml(&options.device_id));
        let _ = writeln!(xml, "      <timeout>{}</timeout>", options.timeout_ms);
        xml.push_str("    </Parameter>\n");
        xml.push_str("    <PrintData>\n");
        let _ = writeln!(xml, "      <epos-print xmlns=\"{}\">", EPOS_NAMESPACE);
        xml.push_str(&self.body);
        xml.push_str("      </epos-print>\n");
        xml.push_str("    </PrintData>\n");
        xml.push_str("  </ePOSPrint>\n");
        xml.push_str("</PrintRequestInfo>\n");

        xml
    }
}

impl Default for EposBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape the five XML special characters
pub fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Ticket date in the record's own offset; unparseable values are printed as-is
pub fn format_created_at(created_at: &str) -> String {
    match DateTime::parse_from_rfc3339(created_at) {
        Ok(dt) => dt.format("%b %-d, %Y %-I:%M %p").to_string(),
        Err(_) => created_at.to_string(),
    }
}

/// Render a kiln request as an ePOS-Print ticket.
///
/// With a photo the image block takes the place of the doodle area.
pub fn format_kiln_ticket(
    record: &KilnRequest,
    photo: Option<&EncodedImage>,
    options: &TicketOptions,
) -> String {
    let mut builder = EposBuilder::new();

    builder
        .lang("en")
        .smooth(true)
        .align(Alignment::Center)
        .font(Font::B)
        .size(2, 2)
        .style(false, false, true)
        .line("Kiln Request")
        .feed_unit(12);

    builder
        .align(Alignment::Left)
        .font(Font::A)
        .size(1, 1)
        .style(false, false, false)
        .field("Date", &format_created_at(&record.created_at))
        .field("Name", &record.full_name())
        .field("Dimensions", &record.dimensions_display())
        .field("Quantity", &record.quantity.to_string())
        .field("Cost", &record.cost_display())
        .field("Firing Type", &record.firing_type);

    if let Some(email) = record.email.as_deref().filter(|e| !e.is_empty()) {
        builder.field("Email", email);
    }

    if record.non_member == Some(true) {
        builder.field("Non-member", "Yes");
    }

    builder.feed_unit(12);

    match photo {
        Some(image) => {
            builder.align(Alignment::Center).image(image);
        }
        None => {
            builder.line("Doodle:").feed_lines(DOODLE_FEED_LINES);
        }
    }

    builder.feed_unit(12).cut(CutType::Feed);

    builder.build(options)
}

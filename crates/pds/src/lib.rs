// This is a library for reading planetary DEMs stored as PDS-labeled IMG files.
//
// A PDS IMG product starts with a plain-text label: KEY = VALUE lines and
// nested OBJECT blocks, terminated by a line reading END. The label describes
// a binary raster of little-endian 32-bit floats that follows it. HiRISE
// DTMs are the motivating product:
//   https://www.uahirise.org/dtm/
//   https://pds.nasa.gov/datastandards/pds3/standards/
//
// The row pipeline is pull-based. The decoder yields one scanline per pull
// and every transform stage (crop, bin, shift, scale) wraps the upstream
// iterator, so a multi-hundred-million-sample image never has to sit in
// memory at once. Peak memory per stage is one row, or k rows for a k-by-k
// bin.

use log::{debug, info, trace, warn};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Result type for IMG parsing and mesh generation.
pub type Result<T> = std::result::Result<T, PdsError>;

/// Errors that can occur while importing a PDS IMG product.
///
/// All of these are fatal to the current import. Nothing is retried
/// internally; the import is a one-shot batch transform with no
/// partial-success semantics.
#[derive(Error, Debug)]
pub enum PdsError {
    /// The label text could not be parsed into a key/value tree.
    #[error("malformed PDS label: {0}")]
    MalformedLabel(String),

    /// The MISSING_CONSTANT bit pattern is not one this library recognizes.
    #[error("unsupported MISSING_CONSTANT encoding: {0}")]
    UnsupportedMissingConstant(String),

    /// The binary payload holds fewer samples than the label promises.
    #[error("image payload truncated at row {0}")]
    TruncatedImage(u32),

    /// The caller-supplied import options are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One node of a parsed PDS label.
///
/// A label is a sequence of scalars (KEY = VALUE) and objects (OBJECT = NAME
/// through the matching END_OBJECT = NAME), where objects nest. The root of a
/// parsed label is an Object with an empty name. Keys are not required to be
/// unique; lookups use the last match.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelNode {
    Scalar { key: String, value: String },
    Object { name: String, children: Vec<LabelNode> },
}

impl LabelNode {
    /// Reads label lines from the reader until the END sentinel and parses them.
    ///
    /// The reader is left positioned directly after the END line; callers
    /// that want the payload should seek to the offset named by the label
    /// rather than trusting that position.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<LabelNode> {
        let mut lines: Vec<String> = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(PdsError::MalformedLabel(String::from(
                    "input ended before the END line",
                )));
            }
            let done = line.trim_end() == "END";
            lines.push(line);
            if done {
                break;
            }
        }
        debug!("read {} label lines", lines.len());
        Self::parse(lines.iter().map(|s| s.as_str()))
    }

    /// Parses the given label lines into a tree rooted at an unnamed Object.
    ///
    /// The line sequence must include its own terminator: END at the top
    /// level, END_OBJECT = NAME for each nested object. Running out of lines
    /// before the terminator is a MalformedLabel error.
    pub fn parse<'s, I>(mut lines: I) -> Result<LabelNode>
    where
        I: Iterator<Item = &'s str>,
    {
        let children = Self::parse_children(&mut lines, None)?;
        Ok(LabelNode::Object {
            name: String::new(),
            children,
        })
    }

    /// One recursion frame: consumes lines until this frame's terminator.
    fn parse_children<'s, I>(lines: &mut I, object_name: Option<&str>) -> Result<Vec<LabelNode>>
    where
        I: Iterator<Item = &'s str>,
    {
        let terminator = match object_name {
            Some(name) => format!("END_OBJECT = {}", name),
            None => String::from("END"),
        };

        let mut children = Vec::new();
        loop {
            let line = lines.next().ok_or_else(|| {
                PdsError::MalformedLabel(format!("label ended before \"{}\"", terminator))
            })?;
            if line.trim_end() == terminator {
                return Ok(children);
            }

            // Everything from the first /* onward is a comment.
            let line = match line.find("/*") {
                Some(comment) => &line[..comment],
                None => line,
            };

            if let Some(rest) = line.strip_prefix("OBJECT =") {
                let name = rest.trim().to_string();
                let nested = Self::parse_children(lines, Some(&name))?;
                children.push(LabelNode::Object {
                    name,
                    children: nested,
                });
            } else if line.contains("END_OBJECT =") {
                // A closer that is not this frame's terminator. Terminator
                // detection is the line equality check above, so any other
                // closer is skipped.
            } else if !line.trim().is_empty() {
                if let Some((key, value)) = line.split_once(" = ") {
                    children.push(LabelNode::Scalar {
                        key: key.trim().to_string(),
                        value: value.trim().to_string(),
                    });
                }
            }
        }
    }

    fn children(&self) -> &[LabelNode] {
        match self {
            LabelNode::Object { children, .. } => children,
            LabelNode::Scalar { .. } => &[],
        }
    }

    /// Last-match lookup of a scalar among this node's direct children.
    fn scalar(&self, key: &str) -> Option<&str> {
        let mut found = None;
        for child in self.children() {
            if let LabelNode::Scalar { key: k, value } = child {
                if k == key {
                    found = Some(value.as_str());
                }
            }
        }
        found
    }

    /// Returns (LINE_SAMPLES, LINES) from the first object named IMAGE.
    ///
    /// The search recurses into the first IMAGE object it meets at each
    /// level, so the values come from the nearest-enclosing IMAGE block.
    pub fn find_lines_and_samples(&self) -> Result<(u32, u32)> {
        let mut samples = None;
        let mut lines = None;
        for child in self.children() {
            match child {
                LabelNode::Object { name, .. } if name == "IMAGE" => {
                    return child.find_lines_and_samples();
                }
                LabelNode::Scalar { key, value } => {
                    if key == "LINES" {
                        lines = Some(parse_value(key, value)?);
                    }
                    if key == "LINE_SAMPLES" {
                        samples = Some(parse_value(key, value)?);
                    }
                }
                _ => (),
            }
        }
        match (samples, lines) {
            (Some(samples), Some(lines)) => Ok((samples, lines)),
            _ => Err(PdsError::MalformedLabel(String::from(
                "no LINES / LINE_SAMPLES in an IMAGE object",
            ))),
        }
    }

    /// Returns (VALID_MINIMUM, VALID_MAXIMUM) from the first IMAGE object.
    pub fn find_valid_min_max(&self) -> Result<(f64, f64)> {
        let mut vmin = None;
        let mut vmax = None;
        for child in self.children() {
            match child {
                LabelNode::Object { name, .. } if name == "IMAGE" => {
                    return child.find_valid_min_max();
                }
                LabelNode::Scalar { key, value } => {
                    if key == "VALID_MINIMUM" {
                        vmin = Some(parse_value(key, value)?);
                    }
                    if key == "VALID_MAXIMUM" {
                        vmax = Some(parse_value(key, value)?);
                    }
                }
                _ => (),
            }
        }
        match (vmin, vmax) {
            (Some(vmin), Some(vmax)) => Ok((vmin, vmax)),
            _ => Err(PdsError::MalformedLabel(String::from(
                "no VALID_MINIMUM / VALID_MAXIMUM in an IMAGE object",
            ))),
        }
    }

    /// Decodes MISSING_CONSTANT from the first IMAGE object into its float value.
    ///
    /// The constant is written as a radix-tagged bit pattern. HiRISE products
    /// always use 16#FF7FFFFB#, and that is the only encoding recognized
    /// here; anything else needs explicit support before it can be trusted.
    pub fn find_missing_constant(&self) -> Result<f32> {
        for child in self.children() {
            if let LabelNode::Object { name, .. } = child {
                if name == "IMAGE" {
                    return child.find_missing_constant();
                }
            }
        }
        let repr = self.scalar("MISSING_CONSTANT").ok_or_else(|| {
            PdsError::MalformedLabel(String::from("no MISSING_CONSTANT in an IMAGE object"))
        })?;
        let pieces: Vec<&str> = repr.split('#').collect();
        if pieces.len() >= 2 && pieces[0] == "16" && pieces[1] == "FF7FFFFB" {
            return Ok(f32::from_bits(0xFF7FFFFB));
        }
        Err(PdsError::UnsupportedMissingConstant(repr.to_string()))
    }

    /// Derives the byte offset of the pixel payload from the label itself.
    ///
    /// Two pointer forms appear in PDS products:
    ///   ^IMAGE = n             the payload starts at record n (counted
    ///                          from 1) of RECORD_BYTES bytes each
    ///   ^IMAGE = n <BYTES>     the payload starts at byte n (counted from 1)
    pub fn find_data_offset(&self) -> Result<u64> {
        let pointer = self
            .scalar("^IMAGE")
            .ok_or_else(|| PdsError::MalformedLabel(String::from("no ^IMAGE pointer in label")))?;

        if let Some(bytes) = pointer.strip_suffix("<BYTES>") {
            let byte: u64 = parse_value("^IMAGE", bytes.trim())?;
            if byte == 0 {
                return Err(PdsError::MalformedLabel(String::from(
                    "^IMAGE byte offsets count from 1",
                )));
            }
            return Ok(byte - 1);
        }

        let record: u64 = parse_value("^IMAGE", pointer)?;
        if record == 0 {
            return Err(PdsError::MalformedLabel(String::from(
                "^IMAGE records count from 1",
            )));
        }
        let record_bytes: u64 = match self.scalar("RECORD_BYTES") {
            Some(value) => parse_value("RECORD_BYTES", value)?,
            None => {
                return Err(PdsError::MalformedLabel(String::from(
                    "^IMAGE names a record but the label has no RECORD_BYTES",
                )))
            }
        };
        Ok((record - 1) * record_bytes)
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter, indent: usize) -> fmt::Result {
        match self {
            LabelNode::Scalar { key, value } => {
                writeln!(f, "{:indent$}{} = {}", "", key, value, indent = indent)
            }
            LabelNode::Object { name, children } => {
                let mut next_indent = indent;
                if !name.is_empty() {
                    writeln!(f, "{:indent$}OBJECT {}", "", name, indent = indent)?;
                    next_indent += 2;
                }
                for child in children {
                    child.fmt_indented(f, next_indent)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for LabelNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// Parses a label value or reports which key held the bad text.
fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PdsError::MalformedLabel(format!("bad value for {}: {:?}", key, value)))
}

#[cfg(test)]
mod label_tests {
    use super::*;

    const LABEL: &str = "\
PDS_VERSION_ID = PDS3\n\
RECORD_BYTES = 128\n\
^IMAGE = 3\n\
OBJECT = PROJECTION\n\
  MAP_SCALE = 1.0 /* meters per pixel */\n\
END_OBJECT = PROJECTION\n\
OBJECT = IMAGE\n\
  LINES = 7633\n\
  LINE_SAMPLES = 5341\n\
  VALID_MINIMUM = -2990.89\n\
  VALID_MAXIMUM = -1865.84\n\
  MISSING_CONSTANT = 16#FF7FFFFB#\n\
END_OBJECT = IMAGE\n\
END\n";

    fn parsed() -> LabelNode {
        LabelNode::parse(LABEL.lines()).unwrap()
    }

    #[test]
    fn lines_and_samples_round_trip() {
        assert_eq!((5341, 7633), parsed().find_lines_and_samples().unwrap());
    }

    #[test]
    fn valid_min_max_parsed() {
        assert_eq!((-2990.89, -1865.84), parsed().find_valid_min_max().unwrap());
    }

    #[test]
    fn missing_constant_decoded_from_bits() {
        let missing = parsed().find_missing_constant().unwrap();
        assert_eq!(0xFF7FFFFB, missing.to_bits());
        // The HiRISE constant is a huge negative normal float, not a NaN.
        assert!(missing < -3.0e38);
    }

    #[test]
    fn unsupported_missing_constant_rejected() {
        let label = LabelNode::parse(
            "OBJECT = IMAGE\nMISSING_CONSTANT = 8#177#\nEND_OBJECT = IMAGE\nEND\n".lines(),
        )
        .unwrap();
        let err = label.find_missing_constant().unwrap_err();
        assert!(matches!(err, PdsError::UnsupportedMissingConstant(_)));
    }

    #[test]
    fn comments_stripped_and_blank_lines_ignored() {
        let label = LabelNode::parse(
            "\nKEY = 1 /* trailing comment */\n/* whole-line comment */\nEND\n".lines(),
        )
        .unwrap();
        assert_eq!(
            LabelNode::Object {
                name: String::new(),
                children: vec![LabelNode::Scalar {
                    key: String::from("KEY"),
                    value: String::from("1"),
                }],
            },
            label
        );
    }

    #[test]
    fn last_match_wins_for_duplicate_keys() {
        let label = LabelNode::parse(
            "OBJECT = IMAGE\nLINES = 1\nLINE_SAMPLES = 2\nLINES = 3\nEND_OBJECT = IMAGE\nEND\n"
                .lines(),
        )
        .unwrap();
        assert_eq!((2, 3), label.find_lines_and_samples().unwrap());
    }

    #[test]
    fn missing_terminator_is_an_error() {
        let err = LabelNode::parse("KEY = 1\nOBJECT = IMAGE\nEND\n".lines()).unwrap_err();
        assert!(matches!(err, PdsError::MalformedLabel(_)));

        let err = LabelNode::parse("KEY = 1\n".lines()).unwrap_err();
        assert!(matches!(err, PdsError::MalformedLabel(_)));
    }

    #[test]
    fn accessors_fail_without_an_image_object() {
        let label = LabelNode::parse("LINES = 4\nEND\n".lines()).unwrap();
        // A top-level LINES without LINE_SAMPLES is not enough.
        assert!(matches!(
            label.find_lines_and_samples().unwrap_err(),
            PdsError::MalformedLabel(_)
        ));
        assert!(matches!(
            label.find_valid_min_max().unwrap_err(),
            PdsError::MalformedLabel(_)
        ));
        assert!(matches!(
            label.find_missing_constant().unwrap_err(),
            PdsError::MalformedLabel(_)
        ));
    }

    #[test]
    fn data_offset_from_record_pointer() {
        assert_eq!(256, parsed().find_data_offset().unwrap());
    }

    #[test]
    fn data_offset_from_byte_pointer() {
        let label = LabelNode::parse("^IMAGE = 117249 <BYTES>\nEND\n".lines()).unwrap();
        assert_eq!(117248, label.find_data_offset().unwrap());
    }

    #[test]
    fn data_offset_requires_a_pointer() {
        let label = LabelNode::parse("RECORD_BYTES = 128\nEND\n".lines()).unwrap();
        assert!(matches!(
            label.find_data_offset().unwrap_err(),
            PdsError::MalformedLabel(_)
        ));
    }

    #[test]
    fn display_renders_nested_tree() {
        let text = format!("{}", parsed());
        assert!(text.contains("OBJECT IMAGE"));
        assert!(text.contains("  LINES = 7633"));
        assert!(text.contains("RECORD_BYTES = 128"));
    }
}

/// The raster geometry and value range promised by a label.
///
/// Built once after the label parse and read-only afterwards; every stream
/// stage consults it but none of them change it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageDescriptor {
    /// Samples per row (LINE_SAMPLES).
    pub line_samples: u32,
    /// Row count (LINES).
    pub lines: u32,
    /// Smallest elevation that counts as real data.
    pub valid_min: f64,
    /// Largest elevation that counts as real data.
    pub valid_max: f64,
    /// The no-data sentinel, decoded from its label bit pattern.
    pub missing_constant: f32,
}

impl ImageDescriptor {
    pub fn from_label(label: &LabelNode) -> Result<ImageDescriptor> {
        let (line_samples, lines) = label.find_lines_and_samples()?;
        let (valid_min, valid_max) = label.find_valid_min_max()?;
        let missing_constant = label.find_missing_constant()?;
        Ok(ImageDescriptor {
            line_samples,
            lines,
            valid_min,
            valid_max,
            missing_constant,
        })
    }
}

/// One scanline of elevations. None marks a missing sample.
pub type Row = Vec<Option<f64>>;

/// The geometry of a row stream, updated as stages reshape it.
///
/// The original dimensions ride along unchanged; width and height describe
/// the rows the stream will actually yield. pixel_scale grows as binning
/// makes each remaining sample cover more ground.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryRecord {
    pub orig_width: u32,
    pub orig_height: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_scale: (f64, f64),
}

impl GeometryRecord {
    /// The geometry after a k-by-k bin: floor-divided dimensions, scaled pixels.
    fn binned(&self, k: u32) -> GeometryRecord {
        GeometryRecord {
            width: self.width / k,
            height: self.height / k,
            pixel_scale: (self.pixel_scale.0 * k as f64, self.pixel_scale.1 * k as f64),
            ..*self
        }
    }
}

type BoxedRows<'a> = Box<dyn Iterator<Item = Result<Row>> + 'a>;

/// A lazy sequence of rows plus the geometry describing them.
///
/// Exactly `geometry().height` rows follow, each `geometry().width` samples
/// wide. The transform methods consume the stream and hand back a reshaped
/// one; rows only move when the final consumer pulls.
pub struct RowStream<'a> {
    geometry: GeometryRecord,
    rows: BoxedRows<'a>,
}

/// Decodes raw little-endian 32-bit floats into one row per pull.
struct RowDecoder<R> {
    reader: R,
    samples: usize,
    row: u32,
    rows: u32,
}

impl<R: Read> Iterator for RowDecoder<R> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.row >= self.rows {
            return None;
        }
        let mut raw = vec![0u8; 4 * self.samples];
        if let Err(e) = self.reader.read_exact(&mut raw) {
            // A short read must not yield a partial or zero-padded row.
            let row = self.row;
            self.row = self.rows;
            return Some(Err(match e.kind() {
                io::ErrorKind::UnexpectedEof => PdsError::TruncatedImage(row),
                _ => PdsError::Io(e),
            }));
        }
        self.row += 1;
        let row = raw
            .chunks_exact(4)
            .map(|b| Some(f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64))
            .collect();
        Some(Ok(row))
    }
}

/// Passes through a rectangular sub-window and stops pulling once done.
struct CropRows<'a> {
    rows: BoxedRows<'a>,
    columns: std::ops::Range<usize>,
    skip: u32,
    remaining: u32,
}

impl Iterator for CropRows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.skip > 0 {
            match self.rows.next() {
                Some(Ok(_)) => self.skip -= 1,
                Some(Err(e)) => {
                    self.skip = 0;
                    self.remaining = 0;
                    return Some(Err(e));
                }
                None => {
                    self.skip = 0;
                    self.remaining = 0;
                    return None;
                }
            }
        }
        if self.remaining == 0 {
            // The vertical window is satisfied; the rest of the upstream is
            // never consumed.
            return None;
        }
        match self.rows.next() {
            Some(Ok(row)) => {
                self.remaining -= 1;
                Some(Ok(row[self.columns.clone()].to_vec()))
            }
            Some(Err(e)) => {
                self.remaining = 0;
                Some(Err(e))
            }
            None => {
                self.remaining = 0;
                None
            }
        }
    }
}

/// Averages the non-missing samples within each k-by-k window.
struct AveragedBin<'a> {
    rows: BoxedRows<'a>,
    window: usize,
    out_width: usize,
    windows_left: u32,
}

impl Iterator for AveragedBin<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.windows_left == 0 {
            return None;
        }
        let mut held: Vec<Row> = Vec::with_capacity(self.window);
        for _ in 0..self.window {
            match self.rows.next() {
                Some(Ok(row)) => held.push(row),
                Some(Err(e)) => {
                    self.windows_left = 0;
                    return Some(Err(e));
                }
                None => {
                    self.windows_left = 0;
                    return None;
                }
            }
        }
        self.windows_left -= 1;

        let mut out: Row = Vec::with_capacity(self.out_width);
        for i in 0..self.out_width {
            let base = i * self.window;
            let mut sum = 0.0;
            let mut count = 0usize;
            for row in &held {
                for sample in row[base..base + self.window].iter().flatten() {
                    sum += sample;
                    count += 1;
                }
            }
            // A window with no valid samples stays missing.
            out.push(if count == 0 {
                None
            } else {
                Some(sum / count as f64)
            });
        }
        Some(Ok(out))
    }
}

/// Keeps one fixed sample (first row, last column) from each k-by-k window.
///
/// The sampled cell's own missing/present status passes through untouched;
/// no averaging and no masking happens here.
struct SampledBin<'a> {
    rows: BoxedRows<'a>,
    window: usize,
    out_width: usize,
    windows_left: u32,
}

impl Iterator for SampledBin<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.windows_left == 0 {
            return None;
        }
        let lead: Row = match self.rows.next() {
            Some(Ok(row)) => row,
            Some(Err(e)) => {
                self.windows_left = 0;
                return Some(Err(e));
            }
            None => {
                self.windows_left = 0;
                return None;
            }
        };
        for _ in 1..self.window {
            match self.rows.next() {
                Some(Ok(_)) => (),
                Some(Err(e)) => {
                    self.windows_left = 0;
                    return Some(Err(e));
                }
                None => {
                    self.windows_left = 0;
                    return None;
                }
            }
        }
        self.windows_left -= 1;

        let out: Row = lead
            .iter()
            .skip(self.window - 1)
            .step_by(self.window)
            .take(self.out_width)
            .copied()
            .collect();
        Some(Ok(out))
    }
}

impl<'a> RowStream<'a> {
    /// Starts a stream over the raw payload described by the label.
    ///
    /// The first pull after construction yields the top image row. Every
    /// sample is still present at this point; masking of the missing
    /// constant happens in shift_to_origin.
    pub fn decode<R: Read + 'a>(reader: R, descriptor: &ImageDescriptor) -> RowStream<'a> {
        let geometry = GeometryRecord {
            orig_width: descriptor.line_samples,
            orig_height: descriptor.lines,
            width: descriptor.line_samples,
            height: descriptor.lines,
            pixel_scale: (1.0, 1.0),
        };
        trace!(
            "decoding {} rows of {} samples each",
            geometry.height,
            geometry.width
        );
        RowStream {
            geometry,
            rows: Box::new(RowDecoder {
                reader,
                samples: descriptor.line_samples as usize,
                row: 0,
                rows: descriptor.lines,
            }),
        }
    }

    /// Wraps an existing geometry and row iterator as a stream.
    ///
    /// Useful for synthetic terrain; file-backed streams come from decode().
    pub fn from_rows<I>(geometry: GeometryRecord, rows: I) -> RowStream<'a>
    where
        I: Iterator<Item = Result<Row>> + 'a,
    {
        RowStream {
            geometry,
            rows: Box::new(rows),
        }
    }

    pub fn geometry(&self) -> &GeometryRecord {
        &self.geometry
    }

    /// Restricts the stream to a rectangular window.
    ///
    /// A window that reaches past the upstream bounds is clamped to the full
    /// upstream extent with its offset reset to 0. That is a permissive
    /// policy rather than an error, so it is logged loudly.
    pub fn crop(self, width: u32, height: u32, x_offset: u32, y_offset: u32) -> RowStream<'a> {
        let g = self.geometry;
        let (mut width, mut x_offset) = (width, x_offset);
        let (mut height, mut y_offset) = (height, y_offset);
        if width as u64 + x_offset as u64 > g.width as u64 {
            warn!(
                "crop width {}+{} exceeds upstream width {}; using the full width",
                width, x_offset, g.width
            );
            width = g.width;
            x_offset = 0;
        }
        if height as u64 + y_offset as u64 > g.height as u64 {
            warn!(
                "crop height {}+{} exceeds upstream height {}; using the full height",
                height, y_offset, g.height
            );
            height = g.height;
            y_offset = 0;
        }
        let geometry = GeometryRecord {
            width,
            height,
            ..g
        };
        debug!(
            "crop: {}x{} at +{}+{} of {}x{}",
            width, height, x_offset, y_offset, g.width, g.height
        );
        RowStream {
            geometry,
            rows: Box::new(CropRows {
                rows: self.rows,
                columns: x_offset as usize..(x_offset + width) as usize,
                skip: y_offset,
                remaining: height,
            }),
        }
    }

    /// Masks missing samples and shifts elevations to start at zero.
    ///
    /// A sample equal to the missing constant, or outside the descriptor's
    /// valid range, becomes None. Every surviving sample has valid_min
    /// subtracted, so the lowest valid elevation lands at 0.
    pub fn shift_to_origin(self, descriptor: &ImageDescriptor) -> RowStream<'a> {
        let missing = descriptor.missing_constant as f64;
        let valid_min = descriptor.valid_min;
        let valid_max = descriptor.valid_max;
        self.map_samples(move |v| {
            if v == missing || v < valid_min || v > valid_max {
                None
            } else {
                Some(v - valid_min)
            }
        })
    }

    /// Multiplies every present sample by the given factor.
    pub fn scale_z(self, factor: f64) -> RowStream<'a> {
        self.map_samples(move |v| Some(v * factor))
    }

    /// Maps every present sample linearly from the old range onto the new.
    ///
    /// The terrain keeps its shape; only the units change. The old range
    /// must be known up front and must not be empty.
    pub fn normalize(self, old_range: (f64, f64), new_range: (f64, f64)) -> RowStream<'a> {
        let factor = (new_range.1 - new_range.0) / (old_range.1 - old_range.0);
        let (old_min, new_min) = (old_range.0, new_range.0);
        debug!(
            "normalize: [{}, {}] -> [{}, {}]",
            old_range.0, old_range.1, new_range.0, new_range.1
        );
        self.map_samples(move |v| Some((v - old_min) * factor + new_min))
    }

    /// Applies the selected binning mode, if any.
    pub fn bin(self, mode: BinMode) -> RowStream<'a> {
        match mode {
            BinMode::None => self,
            BinMode::Bin2 => self.bin_averaged(2),
            BinMode::Bin6 => self.bin_averaged(6),
            BinMode::Bin6Fast => self.bin_sampled(6),
            BinMode::Bin12 => self.bin_averaged(12),
            BinMode::Bin12Fast => self.bin_sampled(12),
        }
    }

    /// k-by-k averaging decimation.
    ///
    /// Trailing rows and columns that do not fill a whole window are
    /// dropped, matching the floor() in the output geometry.
    fn bin_averaged(self, k: u32) -> RowStream<'a> {
        let geometry = self.geometry.binned(k);
        debug!(
            "bin {0}x{0} averaged: {1}x{2} -> {3}x{4}",
            k, self.geometry.width, self.geometry.height, geometry.width, geometry.height
        );
        RowStream {
            geometry,
            rows: Box::new(AveragedBin {
                rows: self.rows,
                window: k as usize,
                out_width: geometry.width as usize,
                windows_left: geometry.height,
            }),
        }
    }

    /// k-by-k fixed-offset decimation, trading accuracy for speed.
    fn bin_sampled(self, k: u32) -> RowStream<'a> {
        let geometry = self.geometry.binned(k);
        debug!(
            "bin {0}x{0} sampled: {1}x{2} -> {3}x{4}",
            k, self.geometry.width, self.geometry.height, geometry.width, geometry.height
        );
        RowStream {
            geometry,
            rows: Box::new(SampledBin {
                rows: self.rows,
                window: k as usize,
                out_width: geometry.width as usize,
                windows_left: geometry.height,
            }),
        }
    }

    /// Pointwise stage: geometry passes through, samples are remapped.
    fn map_samples<F>(self, f: F) -> RowStream<'a>
    where
        F: Fn(f64) -> Option<f64> + 'a,
    {
        let rows = self
            .rows
            .map(move |row| row.map(|row| row.into_iter().map(|s| s.and_then(&f)).collect()));
        RowStream {
            geometry: self.geometry,
            rows: Box::new(rows),
        }
    }

    /// Drains the stream into memory. Mostly for previews and tests; the
    /// mesh builder consumes rows one at a time instead.
    pub fn collect_rows(self) -> Result<(GeometryRecord, Vec<Row>)> {
        let geometry = self.geometry;
        let rows = self.rows.collect::<Result<Vec<Row>>>()?;
        Ok((geometry, rows))
    }
}

impl Iterator for RowStream<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

#[cfg(test)]
mod stream_tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Cursor;
    use std::rc::Rc;

    fn descriptor(samples: u32, lines: u32) -> ImageDescriptor {
        ImageDescriptor {
            line_samples: samples,
            lines,
            valid_min: 0.0,
            valid_max: 1000.0,
            missing_constant: f32::from_bits(0xFF7FFFFB),
        }
    }

    fn stream_of(rows: Vec<Row>) -> RowStream<'static> {
        let geometry = GeometryRecord {
            orig_width: rows[0].len() as u32,
            orig_height: rows.len() as u32,
            width: rows[0].len() as u32,
            height: rows.len() as u32,
            pixel_scale: (1.0, 1.0),
        };
        RowStream::from_rows(geometry, rows.into_iter().map(Ok))
    }

    fn present(rows: Vec<Vec<f64>>) -> Vec<Row> {
        rows.into_iter()
            .map(|row| row.into_iter().map(Some).collect())
            .collect()
    }

    /// Upstream that counts how many rows were actually pulled.
    struct CountingRows {
        pulled: Rc<Cell<u32>>,
        width: usize,
        left: u32,
    }

    impl Iterator for CountingRows {
        type Item = Result<Row>;

        fn next(&mut self) -> Option<Self::Item> {
            if self.left == 0 {
                return None;
            }
            self.left -= 1;
            self.pulled.set(self.pulled.get() + 1);
            Some(Ok(vec![Some(0.0); self.width]))
        }
    }

    #[test]
    fn decode_yields_little_endian_rows() {
        let mut bytes = Vec::new();
        for v in [1.5f32, -2.0, 0.0, 42.0, 7.0, -0.5] {
            bytes.extend(v.to_le_bytes());
        }
        let stream = RowStream::decode(Cursor::new(bytes), &descriptor(3, 2));
        assert_eq!(
            GeometryRecord {
                orig_width: 3,
                orig_height: 2,
                width: 3,
                height: 2,
                pixel_scale: (1.0, 1.0),
            },
            *stream.geometry()
        );
        let (_, rows) = stream.collect_rows().unwrap();
        assert_eq!(
            vec![
                vec![Some(1.5), Some(-2.0), Some(0.0)],
                vec![Some(42.0), Some(7.0), Some(-0.5)],
            ],
            rows
        );
    }

    #[test]
    fn decode_reads_raw_bytes_little_endian() {
        #[rustfmt::skip]
        let bytes: [u8; 8] = [
            0, 0, 128, 63,  // 1.0f32
            0, 0, 0, 192,   // -2.0f32
        ];
        let (_, rows) = RowStream::decode(Cursor::new(bytes.to_vec()), &descriptor(2, 1))
            .collect_rows()
            .unwrap();
        assert_eq!(vec![vec![Some(1.0), Some(-2.0)]], rows);
    }

    #[test]
    fn short_read_is_truncation_not_a_partial_row() {
        // Two full rows promised, one and a half provided.
        let mut bytes = Vec::new();
        for v in [1.0f32, 2.0, 3.0] {
            bytes.extend(v.to_le_bytes());
        }
        let mut stream = RowStream::decode(Cursor::new(bytes), &descriptor(2, 2));
        assert!(stream.next().unwrap().is_ok());
        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err, PdsError::TruncatedImage(1)));
        // The decoder stops cleanly after the failure.
        assert!(stream.next().is_none());
    }

    #[test]
    fn averaged_bin_takes_the_exact_mean() {
        let rows = present(vec![vec![1.0, 2.0, 9.0, 9.0], vec![3.0, 6.0, 9.0, 9.0]]);
        let (geometry, out) = stream_of(rows).bin(BinMode::Bin2).collect_rows().unwrap();
        assert_eq!((2, 1), (geometry.width, geometry.height));
        assert_eq!((2.0, 2.0), geometry.pixel_scale);
        assert!((out[0][0].unwrap() - 3.0).abs() < 1e-9);
        assert!((out[0][1].unwrap() - 9.0).abs() < 1e-9);
    }

    #[test]
    fn averaged_bin_skips_missing_samples() {
        let rows = vec![vec![Some(1.0), None], vec![Some(3.0), Some(5.0)]];
        let (_, out) = stream_of(rows).bin(BinMode::Bin2).collect_rows().unwrap();
        // Mean over the three present samples only.
        assert!((out[0][0].unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn averaged_bin_keeps_all_missing_windows_missing() {
        let rows = vec![vec![None, None], vec![None, None]];
        let (_, out) = stream_of(rows).bin(BinMode::Bin2).collect_rows().unwrap();
        assert_eq!(vec![vec![None]], out);
    }

    #[test]
    fn binning_drops_partial_trailing_windows() {
        // 5x5 with k=2: the fifth row and fifth column never contribute.
        let rows = present(vec![vec![1.0; 5]; 5]);
        let (geometry, out) = stream_of(rows).bin(BinMode::Bin2).collect_rows().unwrap();
        assert_eq!((2, 2), (geometry.width, geometry.height));
        assert_eq!(2, out.len());
        assert_eq!(2, out[0].len());
    }

    #[test]
    fn binned_geometry_uses_floor_and_scales_pixels() {
        let rows = present(vec![vec![0.0; 13]; 13]);
        let (geometry, out) = stream_of(rows).bin(BinMode::Bin6).collect_rows().unwrap();
        assert_eq!((2, 2), (geometry.width, geometry.height));
        assert_eq!((6.0, 6.0), geometry.pixel_scale);
        assert_eq!(13, geometry.orig_width);
        assert_eq!(2, out.len());
    }

    #[test]
    fn sampled_bin_takes_first_row_last_column() {
        // Make the sampled cell disagree with the window mean.
        let mut rows = present(vec![vec![0.0; 6]; 6]);
        rows[0][5] = Some(50.0);
        let (geometry, out) = stream_of(rows)
            .bin(BinMode::Bin6Fast)
            .collect_rows()
            .unwrap();
        assert_eq!((1, 1), (geometry.width, geometry.height));
        assert_eq!(vec![vec![Some(50.0)]], out);
    }

    #[test]
    fn sampled_bin_passes_missing_status_through() {
        let mut rows = present(vec![vec![0.0; 6]; 6]);
        rows[0][5] = None;
        let (_, out) = stream_of(rows)
            .bin(BinMode::Bin6Fast)
            .collect_rows()
            .unwrap();
        // Every other sample in the window is present, but the sampled one
        // is not, and no averaging rescues it.
        assert_eq!(vec![vec![None]], out);
    }

    #[test]
    fn crop_slices_rows_and_geometry() {
        let rows = present(vec![
            vec![0.0, 1.0, 2.0, 3.0],
            vec![4.0, 5.0, 6.0, 7.0],
            vec![8.0, 9.0, 10.0, 11.0],
        ]);
        let (geometry, out) = stream_of(rows).crop(2, 1, 1, 1).collect_rows().unwrap();
        assert_eq!((2, 1), (geometry.width, geometry.height));
        assert_eq!(vec![vec![Some(5.0), Some(6.0)]], out);
    }

    #[test]
    fn oversized_crop_clamps_to_upstream_bounds() {
        let rows = present(vec![vec![0.0; 100]; 100]);
        let (geometry, out) = stream_of(rows)
            .crop(1000, 1000, 0, 0)
            .collect_rows()
            .unwrap();
        assert_eq!((100, 100), (geometry.width, geometry.height));
        assert_eq!(100, out.len());
    }

    #[test]
    fn crop_offset_overflow_resets_the_offset() {
        let rows = present(vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]]);
        let (geometry, out) = stream_of(rows).crop(2, 2, 2, 0).collect_rows().unwrap();
        // 2 wide at offset 2 does not fit in 3 columns, so the request falls
        // back to the full width at offset 0.
        assert_eq!((3, 2), (geometry.width, geometry.height));
        assert_eq!(vec![Some(0.0), Some(1.0), Some(2.0)], out[0]);
    }

    #[test]
    fn crop_never_pulls_past_its_window() {
        let pulled = Rc::new(Cell::new(0));
        let upstream = CountingRows {
            pulled: Rc::clone(&pulled),
            width: 4,
            left: 100,
        };
        let geometry = GeometryRecord {
            orig_width: 4,
            orig_height: 100,
            width: 4,
            height: 100,
            pixel_scale: (1.0, 1.0),
        };
        let stream = RowStream::from_rows(geometry, upstream).crop(4, 3, 0, 2);
        let (_, out) = stream.collect_rows().unwrap();
        assert_eq!(3, out.len());
        // Two skipped plus three yielded; the other 95 rows stay unread.
        assert_eq!(5, pulled.get());
    }

    #[test]
    fn shift_to_origin_masks_and_rebases() {
        let d = ImageDescriptor {
            line_samples: 4,
            lines: 1,
            valid_min: -10.0,
            valid_max: 10.0,
            missing_constant: f32::from_bits(0xFF7FFFFB),
        };
        let rows = vec![vec![
            Some(d.missing_constant as f64),
            Some(-10.0),
            Some(3.0),
            Some(400.0), // out of the valid range
        ]];
        let (_, out) = stream_of(rows).shift_to_origin(&d).collect_rows().unwrap();
        assert_eq!(vec![vec![None, Some(0.0), Some(13.0), None]], out);
    }

    #[test]
    fn scale_z_multiplies_present_samples_only() {
        let rows = vec![vec![Some(2.0), None, Some(-1.5)]];
        let (_, out) = stream_of(rows).scale_z(10.0).collect_rows().unwrap();
        assert_eq!(vec![vec![Some(20.0), None, Some(-15.0)]], out);
    }

    #[test]
    fn normalize_maps_the_old_range_onto_the_new() {
        let rows = vec![vec![Some(0.0), Some(500.0), None, Some(1000.0)]];
        let (_, out) = stream_of(rows)
            .normalize((0.0, 1000.0), (0.0, 10.0))
            .collect_rows()
            .unwrap();
        assert_eq!(vec![vec![Some(0.0), Some(5.0), None, Some(10.0)]], out);
    }

    #[test]
    fn normalize_honors_nonzero_minimums() {
        let rows = vec![vec![Some(100.0), Some(200.0)]];
        let (_, out) = stream_of(rows)
            .normalize((100.0, 200.0), (1.0, 3.0))
            .collect_rows()
            .unwrap();
        assert_eq!(vec![vec![Some(1.0), Some(3.0)]], out);
    }
}

/// The supported binning modes.
///
/// The averaging modes preserve quality; the fast modes keep one fixed
/// sample per window and skip the arithmetic entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinMode {
    None,
    Bin2,
    Bin6,
    Bin6Fast,
    Bin12,
    Bin12Fast,
}

impl BinMode {
    /// The label used when naming meshes built with this mode.
    pub fn label(&self) -> &'static str {
        match self {
            BinMode::None => "No Bin",
            BinMode::Bin2 => "BIN2",
            BinMode::Bin6 => "BIN6",
            BinMode::Bin6Fast => "BIN6-FAST",
            BinMode::Bin12 => "BIN12",
            BinMode::Bin12Fast => "BIN12-FAST",
        }
    }
}

impl FromStr for BinMode {
    type Err = PdsError;

    fn from_str(s: &str) -> Result<BinMode> {
        match s {
            "NONE" => Ok(BinMode::None),
            "BIN2" => Ok(BinMode::Bin2),
            "BIN6" => Ok(BinMode::Bin6),
            "BIN6-FAST" => Ok(BinMode::Bin6Fast),
            "BIN12" => Ok(BinMode::Bin12),
            "BIN12-FAST" => Ok(BinMode::Bin12Fast),
            _ => Err(PdsError::InvalidConfiguration(format!(
                "unknown bin mode {:?}",
                s
            ))),
        }
    }
}

/// A crop window in upstream pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
}

/// Caller-facing knobs for an import, validated before any I/O happens.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub bin_mode: BinMode,
    /// Uniform scale applied to the mesh: x/y spacing and elevations alike.
    pub scale: f64,
    /// If set, elevations are fit into 0..value before scaling.
    pub normalize: Option<f64>,
    pub crop: Option<CropRegion>,
}

impl Default for ImportOptions {
    fn default() -> ImportOptions {
        ImportOptions {
            bin_mode: BinMode::None,
            scale: 1.0,
            normalize: None,
            crop: None,
        }
    }
}

impl ImportOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(PdsError::InvalidConfiguration(format!(
                "scale must be a positive number, got {}",
                self.scale
            )));
        }
        if let Some(height) = self.normalize {
            if !height.is_finite() || height <= 0.0 {
                return Err(PdsError::InvalidConfiguration(format!(
                    "normalize height must be a positive number, got {}",
                    height
                )));
            }
        }
        if let Some(crop) = &self.crop {
            if crop.width == 0 || crop.height == 0 {
                return Err(PdsError::InvalidConfiguration(format!(
                    "crop region must have a non-zero size, got {}x{}",
                    crop.width, crop.height
                )));
            }
        }
        Ok(())
    }
}


/// A mesh vertex in mesh-local space.
pub type Vertex = [f64; 3];

/// Four vertex indices forming one quad.
pub type Face = [u32; 4];

/// A terrain mesh: vertices plus consistently wound quad faces.
///
/// Faces are wound previous-row-left, previous-row-right, current-row-right,
/// current-row-left. No validation (manifoldness, degenerate quads) happens
/// here; that is the consumer's concern.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Mesh {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub faces: Vec<Face>,
}

impl Mesh {
    /// Builds a mesh by draining the given row stream.
    ///
    /// A vertex is emitted for every present sample, in row-major order, and
    /// a quad for every 2x2 block of adjacent samples that are all present.
    /// Because missing samples get no vertex, the builder carries two
    /// running counters that track how many vertices the previous and the
    /// current row have contributed so far; those counters are what turn a
    /// column position into a vertex index without materializing a dense
    /// index grid. Conceptually, with x marking missing samples:
    ///
    ///   previous row: offset0   x   x  +1  +2  +3
    ///   current row:  offset1   x  +1  +2  +3   x
    ///
    /// The spacing arguments are per-source-pixel; the stream's own pixel
    /// scale is folded in so binned meshes keep their physical extent.
    pub fn from_rows(
        stream: RowStream,
        name: &str,
        horizontal_spacing: f64,
        vertical_spacing: f64,
    ) -> Result<Mesh> {
        use itertools::Itertools;

        let geometry = *stream.geometry();
        let scale_x = horizontal_spacing * geometry.pixel_scale.0;
        let scale_y = vertical_spacing * geometry.pixel_scale.1;

        let mut vertices: Vec<Vertex> = Vec::new();
        let mut faces: Vec<Face> = Vec::new();

        let mut rows = stream;
        let mut last_line: Row = match rows.next() {
            Some(row) => row?,
            None => {
                return Ok(Mesh {
                    name: String::from(name),
                    vertices,
                    faces,
                })
            }
        };
        for (x, z) in last_line.iter().enumerate() {
            if let Some(z) = z {
                vertices.push([x as f64 * scale_x, 0.0, *z]);
            }
        }

        // previous_offset points at the next unclaimed vertex of the row
        // above; current_offset at the next unclaimed vertex of this row.
        let mut previous_offset: u32 = 0;
        let mut current_offset: u32 = last_line.iter().flatten().count() as u32;

        let mut line_count: u32 = 0;
        for row in rows {
            let row = row?;
            line_count += 1;
            let y = -(line_count as f64) * scale_y;

            for (x, z) in row.iter().enumerate() {
                if let Some(z) = z {
                    vertices.push([x as f64 * scale_x, y, *z]);
                }
            }

            for ((prev_left, prev_right), (cur_left, cur_right)) in last_line
                .iter()
                .tuple_windows()
                .zip(row.iter().tuple_windows())
            {
                let corners = [prev_right, prev_left, cur_left, cur_right];
                let missing = corners.iter().filter(|v| v.is_none()).count();
                if missing == 0 {
                    faces.push([
                        previous_offset,
                        previous_offset + 1,
                        current_offset + 1,
                        current_offset,
                    ]);
                }
                // A block with exactly one missing corner could still become
                // a triangle, but triangular faces are not implemented, so
                // it is skipped along with the 2+ missing blocks.
                // TODO: emit a triangular face when a single corner is missing.

                // The counters only advance past vertices that exist.
                if prev_left.is_some() {
                    previous_offset += 1;
                }
                if cur_left.is_some() {
                    current_offset += 1;
                }
            }

            // The column loop never reaches the last sample of either row,
            // so each counter owes one more conditional step.
            if last_line.last().map_or(false, |v| v.is_some()) {
                previous_offset += 1;
            }
            if row.last().map_or(false, |v| v.is_some()) {
                current_offset += 1;
            }

            last_line = row;
        }

        debug!(
            "mesh {:?}: {} vertices, {} faces",
            name,
            vertices.len(),
            faces.len()
        );
        Ok(Mesh {
            name: String::from(name),
            vertices,
            faces,
        })
    }
}


/// One opened IMG file: parsed label, derived descriptor, and the reader
/// positioned for payload decoding.
pub struct ImgFile<R> {
    name: String,
    label: LabelNode,
    descriptor: ImageDescriptor,
    data_offset: u64,
    reader: R,
}

impl ImgFile<io::BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ImgFile<io::BufReader<File>>> {
        let name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.as_ref().display().to_string());
        info!("opening IMG {}", path.as_ref().display());
        let reader = io::BufReader::new(File::open(path.as_ref())?);
        ImgFile::from_reader(reader, &name)
    }
}

impl<R: BufRead + Seek> ImgFile<R> {
    /// Parses the label eagerly; the payload stays untouched until rows().
    pub fn from_reader(mut reader: R, name: &str) -> Result<ImgFile<R>> {
        let label = LabelNode::read_from(&mut reader)?;
        let descriptor = ImageDescriptor::from_label(&label)?;
        let data_offset = label.find_data_offset()?;
        debug!(
            "{}: {} x {} samples, payload at byte {}",
            name, descriptor.line_samples, descriptor.lines, data_offset
        );
        Ok(ImgFile {
            name: String::from(name),
            label,
            descriptor,
            data_offset,
            reader,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &LabelNode {
        &self.label
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Starts a fresh row stream over the raw payload.
    pub fn rows(&mut self) -> Result<RowStream<'_>> {
        self.reader.seek(SeekFrom::Start(self.data_offset))?;
        Ok(RowStream::decode(&mut self.reader, &self.descriptor))
    }

    /// Runs the whole import pipeline and builds the terrain mesh.
    ///
    /// Stage order: crop, then mask-and-shift, then bin, then scale. Masking
    /// runs before binning so the averaging bins see missing samples as
    /// missing; the shift itself is a constant offset, which commutes with
    /// averaging.
    pub fn mesh(&mut self, options: &ImportOptions) -> Result<Mesh> {
        options.validate()?;
        let descriptor = self.descriptor;
        let name = format!("DTM - {}", options.bin_mode.label());

        if options.normalize.is_some() && descriptor.valid_max <= descriptor.valid_min {
            return Err(PdsError::InvalidConfiguration(format!(
                "cannot normalize: the label's valid range [{}, {}] is empty",
                descriptor.valid_min, descriptor.valid_max
            )));
        }

        let mut stream = self.rows()?;
        if let Some(crop) = &options.crop {
            stream = stream.crop(crop.width, crop.height, crop.x_offset, crop.y_offset);
        }
        stream = stream.shift_to_origin(&descriptor);
        if let Some(height) = options.normalize {
            // After the shift the valid elevations span 0..(max - min).
            let span = descriptor.valid_max - descriptor.valid_min;
            stream = stream.normalize((0.0, span), (0.0, height));
        }
        stream = stream.bin(options.bin_mode);
        if options.scale != 1.0 {
            stream = stream.scale_z(options.scale);
        }
        Mesh::from_rows(stream, &name, options.scale, options.scale)
    }
}

impl<R> fmt::Display for ImgFile<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let print_label = f.sign_plus();
        let d = &self.descriptor;
        writeln!(f, "IMG: {}", self.name)?;
        writeln!(
            f,
            "    {} x {} samples; payload at byte {}",
            d.line_samples, d.lines, self.data_offset
        )?;
        writeln!(
            f,
            "    valid range: [{}, {}]; missing constant bits {:#010X}",
            d.valid_min,
            d.valid_max,
            d.missing_constant.to_bits()
        )?;
        if print_label {
            writeln!(f, "\n{}", self.label)?;
        }
        Ok(())
    }
}

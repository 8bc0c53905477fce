// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Control file primitives.

Control files are series of paragraphs separated by blank lines. Each paragraph
is a series of `Name: value` fields. Values can span multiple lines, with
continuation lines starting with whitespace.

See <https://www.debian.org/doc/debian-policy/ch-controlfields.html>.
*/

use {
    std::io::{BufRead, Write},
    thiserror::Error,
};

/// Errors parsing control files.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error reading control file: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },

    #[error("control file lacks a paragraph")]
    NoParagraph,

    #[error("required field missing: {0}")]
    RequiredFieldMissing(&'static str),

    #[error("field {0} must be a single line")]
    FieldNotSingleLine(&'static str),
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// A field in a control file.
///
/// The value retains continuation lines verbatim, joined by `\n`, with the
/// leading whitespace of continuation lines intact.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ControlField {
    name: String,
    value: String,
}

impl ControlField {
    pub fn new(name: impl ToString, value: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw value, including continuation lines.
    pub fn value_str(&self) -> &str {
        &self.value
    }

    /// Whether the value spans multiple lines.
    pub fn is_multiline(&self) -> bool {
        self.value.contains('\n')
    }

    /// Iterate over lines in the value with leading whitespace removed.
    pub fn iter_lines(&self) -> impl Iterator<Item = &str> {
        self.value.lines().map(|x| x.trim_start())
    }

    /// Iterate over whitespace delimited words in the value.
    pub fn iter_words(&self) -> impl Iterator<Item = &str> {
        self.value.split_ascii_whitespace()
    }

    /// Write this field to a writer, terminated by a newline.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.name.as_bytes())?;
        writer.write_all(b":")?;
        if !self.value.is_empty() && !self.value.starts_with('\n') {
            writer.write_all(b" ")?;
        }
        writer.write_all(self.value.as_bytes())?;
        writer.write_all(b"\n")
    }
}

/// A paragraph in a control file.
///
/// Field names are case insensitive on lookup and case preserving on set. A
/// name occurs at most once.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ControlParagraph {
    fields: Vec<ControlField>,
}

impl ControlParagraph {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set a field, replacing any existing field with the same name.
    pub fn set_field(&mut self, field: ControlField) {
        if let Some(existing) = self
            .fields
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(&field.name))
        {
            *existing = field;
        } else {
            self.fields.push(field);
        }
    }

    pub fn set_field_from_string(&mut self, name: impl ToString, value: impl ToString) {
        self.set_field(ControlField::new(name, value));
    }

    /// Remove a field, returning it if present.
    pub fn remove_field(&mut self, name: &str) -> Option<ControlField> {
        let index = self
            .fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))?;

        Some(self.fields.remove(index))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Iterate over fields in insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = &ControlField> {
        self.fields.iter()
    }

    pub fn field(&self, name: &str) -> Option<&ControlField> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value_str())
    }

    /// Obtain the value of a field that must be present and fit on one line.
    pub fn required_single_line(&self, name: &'static str) -> Result<&str> {
        let field = self
            .field(name)
            .ok_or(ControlError::RequiredFieldMissing(name))?;

        if field.is_multiline() {
            Err(ControlError::FieldNotSingleLine(name))
        } else if field.value_str().is_empty() {
            Err(ControlError::RequiredFieldMissing(name))
        } else {
            Ok(field.value_str())
        }
    }

    /// Serialize fields in insertion order.
    ///
    /// No blank line is written after the final field.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for field in &self.fields {
            field.write(writer)?;
        }

        Ok(())
    }
}

impl std::fmt::Display for ControlParagraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for field in &self.fields {
            writeln!(
                f,
                "{}:{}{}",
                field.name,
                if field.value.is_empty() || field.value.starts_with('\n') {
                    ""
                } else {
                    " "
                },
                field.value
            )?;
        }

        Ok(())
    }
}

/// Incremental control file parser.
///
/// Lines are fed in with [Self::write_line]. Completed paragraphs are emitted
/// when a blank line ends them and by [Self::finish] at end of input.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph,
    field: Option<(String, Vec<String>)>,
    line_number: usize,
}

impl ControlFileParser {
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph>> {
        self.line_number += 1;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.trim().is_empty() {
            self.flush_field()?;

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            return match self.field.as_mut() {
                Some((_, lines)) => {
                    lines.push(line.trim_end().to_string());
                    Ok(None)
                }
                None => Err(self.syntax_error("continuation line without a field")),
            };
        }

        self.flush_field()?;

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| self.syntax_error(format!("missing colon in '{}'", line)))?;

        if name.is_empty() || name.contains(char::is_whitespace) || name.starts_with('-') {
            return Err(self.syntax_error(format!("invalid field name '{}'", name)));
        }

        if self.paragraph.has_field(name) {
            return Err(self.syntax_error(format!("duplicate field {}", name)));
        }

        self.field = Some((name.to_string(), vec![value.trim().to_string()]));

        Ok(None)
    }

    /// Finish parsing, returning any paragraph still in progress.
    pub fn finish(mut self) -> Result<Option<ControlParagraph>> {
        self.flush_field()?;

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn syntax_error(&self, reason: impl ToString) -> ControlError {
        ControlError::Syntax {
            line: self.line_number,
            reason: reason.to_string(),
        }
    }

    fn flush_field(&mut self) -> Result<()> {
        if let Some((name, lines)) = self.field.take() {
            self.paragraph.set_field_from_string(name, lines.join("\n"));
        }

        Ok(())
    }
}

/// Streaming reader of [ControlParagraph] from a [BufRead].
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph>> {
        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => return Ok(None),
        };

        loop {
            let mut line = String::new();

            if self.reader.read_line(&mut line)? == 0 {
                return parser.finish();
            }

            if let Some(paragraph) = parser.write_line(&line)? {
                self.parser.replace(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().transpose()
    }
}

/// An ordered series of paragraphs.
#[derive(Clone, Debug, Default)]
pub struct ControlFile {
    paragraphs: Vec<ControlParagraph>,
}

impl ControlFile {
    pub fn parse_reader<R: BufRead>(reader: R) -> Result<Self> {
        let paragraphs = ControlParagraphReader::new(reader).collect::<Result<Vec<_>>>()?;

        Ok(Self { paragraphs })
    }

    pub fn parse_str(s: &str) -> Result<Self> {
        Self::parse_reader(std::io::Cursor::new(s.as_bytes()))
    }

    pub fn add_paragraph(&mut self, p: ControlParagraph) {
        self.paragraphs.push(p);
    }

    pub fn paragraphs(&self) -> impl Iterator<Item = &ControlParagraph> {
        self.paragraphs.iter()
    }

    pub fn into_paragraphs(self) -> impl Iterator<Item = ControlParagraph> {
        self.paragraphs.into_iter()
    }

    /// Serialize paragraphs separated by blank lines.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for (i, p) in self.paragraphs.iter().enumerate() {
            if i > 0 {
                writer.write_all(b"\n")?;
            }
            p.write(writer)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    #[test]
    fn paragraph_field_semantics() {
        let mut p = ControlParagraph::default();

        p.set_field_from_string("foo", "bar");
        p.set_field_from_string("foo", "baz");
        assert_eq!(p.field_str("foo"), Some("baz"));

        p.set_field_from_string("FOO", "bar");
        assert_eq!(p.field_str("foo"), Some("bar"));
        assert_eq!(p.iter_fields().count(), 1);
        assert_eq!(p.field("foo").map(|f| f.name()), Some("FOO"));
    }

    #[test]
    fn parse_multiline_description() -> Result<()> {
        let control = ControlFile::parse_str(indoc! {"
            Package: hello
            Version: 1.0-1
            Description: greet the world
             The classic greeting program.
             .
             Now with more greetings.

            Package: other
            Version: 2
        "})?;

        let paragraphs = control.paragraphs().collect::<Vec<_>>();
        assert_eq!(paragraphs.len(), 2);

        let description = paragraphs[0].field("description").unwrap();
        assert!(description.is_multiline());
        assert_eq!(
            description.value_str(),
            "greet the world\n The classic greeting program.\n .\n Now with more greetings."
        );
        assert_eq!(description.iter_lines().nth(2), Some("."));
        assert_eq!(paragraphs[1].field_str("Package"), Some("other"));

        Ok(())
    }

    #[test]
    fn write_round_trips_values() -> Result<()> {
        let source = "Package: hello\nDescription: short\n long line\nEmpty:\n";
        let control = ControlFile::parse_str(source)?;

        let mut buffer = vec![];
        control.write(&mut buffer)?;
        assert_eq!(String::from_utf8_lossy(&buffer), source);

        Ok(())
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(matches!(
            ControlFile::parse_str("Package hello\n"),
            Err(ControlError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            ControlFile::parse_str(" leading continuation\n"),
            Err(ControlError::Syntax { .. })
        ));
        assert!(matches!(
            ControlFile::parse_str("Package: a\npackage: b\n"),
            Err(ControlError::Syntax { line: 2, .. })
        ));
    }

    #[test]
    fn crlf_line_endings() -> Result<()> {
        let control = ControlFile::parse_str("Package: a\r\nVersion: 1\r\n\r\n")?;
        let p = control.paragraphs().next().unwrap();
        assert_eq!(p.field_str("Version"), Some("1"));

        Ok(())
    }

    #[test]
    fn required_single_line() -> Result<()> {
        let control = ControlFile::parse_str("Package: a\nVersion:\nArchitecture: x\n y\n")?;
        let p = control.paragraphs().next().unwrap();

        assert_eq!(p.required_single_line("Package")?, "a");
        assert!(matches!(
            p.required_single_line("Version"),
            Err(ControlError::RequiredFieldMissing("Version"))
        ));
        assert!(matches!(
            p.required_single_line("Architecture"),
            Err(ControlError::FieldNotSingleLine("Architecture"))
        ));
        assert!(matches!(
            p.required_single_line("Maintainer"),
            Err(ControlError::RequiredFieldMissing("Maintainer"))
        ));

        Ok(())
    }
}

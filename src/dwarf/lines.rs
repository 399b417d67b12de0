// Based on gimli-rs/addr2line (https://github.com/gimli-rs/addr2line):
// > Copyright (c) 2016-2018 The gimli Developers
// >
// > Permission is hereby granted, free of charge, to any
// > person obtaining a copy of this software and associated
// > documentation files (the "Software"), to deal in the
// > Software without restriction, including without
// > limitation the rights to use, copy, modify, merge,
// > publish, distribute, sublicense, and/or sell copies of
// > the Software, and to permit persons to whom the Software
// > is furnished to do so, subject to the following
// > conditions:
// >
// > The above copyright notice and this permission notice
// > shall be included in all copies or substantial portions
// > of the Software.
// >
// > THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF
// > ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED
// > TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A
// > PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT
// > SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY
// > CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION
// > OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR
// > IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// > DEALINGS IN THE SOFTWARE.

use std::cmp::Ordering;
use std::ffi::OsString;
use std::mem;
use std::num::NonZeroU64;
use std::path::Path;
use std::path::PathBuf;

use gimli::Reader as _;

use super::reader::R;

use crate::util::bytes_to_os_str;
use crate::util::bytes_to_path;
use crate::Addr;


/// A source code location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrcLoc {
    /// The directory the file resides in.
    pub dir: PathBuf,
    /// The file name.
    pub file: OsString,
    /// The line number, if known.
    pub line: Option<u32>,
    /// The column number, if known.
    pub column: Option<u32>,
    /// The run-time address of the line table row the location was
    /// taken from.
    pub addr: Addr,
}

impl SrcLoc {
    /// The full path of the source file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }
}


fn render_file<'a>(
    unit: gimli::UnitRef<'_, R<'a>>,
    file: &gimli::FileEntry<R<'a>, usize>,
    header: &gimli::LineProgramHeader<R<'a>, usize>,
) -> gimli::Result<(PathBuf, OsString)> {
    let mut dir = if let Some(comp_dir) = &unit.comp_dir {
        bytes_to_path(&comp_dir.to_slice()?).to_path_buf()
    } else {
        PathBuf::new()
    };

    // The directory index 0 is defined to correspond to the compilation unit
    // directory.
    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            let d = unit.attr_string(directory)?;
            // Absolute paths replace what we have.
            let () = dir.push(bytes_to_path(&d.to_slice()?));
        }
    }

    let f = unit.attr_string(file.path_name())?;
    let file = bytes_to_os_str(&f.to_slice()?).to_os_string();
    Ok((dir, file))
}


#[derive(Debug)]
struct LineRow {
    address: Addr,
    file_index: u64,
    line: u32,
    column: u32,
}

/// A contiguous run of rows, with addresses already biased.
#[derive(Debug)]
pub(super) struct LineSequence {
    pub start: Addr,
    pub end: Addr,
    rows: Box<[LineRow]>,
}


/// The decoded line table of a compilation unit.
#[derive(Debug)]
pub(super) struct Lines {
    files: Box<[(PathBuf, OsString)]>,
    pub sequences: Box<[LineSequence]>,
}

impl Lines {
    /// Decode a line program, moving all addresses by `bias`.
    pub(super) fn parse<'a>(
        unit: gimli::UnitRef<'_, R<'a>>,
        ilnp: gimli::IncompleteLineProgram<R<'a>, usize>,
        bias: Addr,
    ) -> gimli::Result<Self> {
        let mut sequences = Vec::new();
        let mut sequence_rows = Vec::<LineRow>::new();
        let mut rows = ilnp.rows();
        while let Some((_, row)) = rows.next_row()? {
            let address = row.address().wrapping_add(bias);
            if row.end_sequence() {
                if let Some(start) = sequence_rows.first().map(|x| x.address) {
                    let rows = mem::take(&mut sequence_rows);
                    let () = sequences.push(LineSequence {
                        start,
                        end: address,
                        rows: rows.into_boxed_slice(),
                    });
                }
                continue
            }

            let file_index = row.file_index();
            let line = row.line().map(NonZeroU64::get).unwrap_or(0) as u32;
            let column = match row.column() {
                gimli::ColumnType::LeftEdge => 0,
                gimli::ColumnType::Column(x) => x.get() as u32,
            };

            if let Some(last_row) = sequence_rows.last_mut() {
                if last_row.address == address {
                    last_row.file_index = file_index;
                    last_row.line = line;
                    last_row.column = column;
                    continue
                }
            }

            let () = sequence_rows.push(LineRow {
                address,
                file_index,
                line,
                column,
            });
        }
        let () = sequences.sort_by_key(|x| x.start);

        let mut files = Vec::new();
        let header = rows.header();
        match header.file(0) {
            Some(file) => files.push(render_file(unit, file, header)?),
            // DWARF version <= 4 may not have 0th index.
            None => files.push((PathBuf::new(), OsString::new())),
        }
        let mut index = 1;
        while let Some(file) = header.file(index) {
            let () = files.push(render_file(unit, file, header)?);
            index += 1;
        }

        Ok(Self {
            files: files.into_boxed_slice(),
            sequences: sequences.into_boxed_slice(),
        })
    }

    fn row_location(&self, row: &LineRow) -> SrcLoc {
        let (dir, file) = self
            .files
            .get(row.file_index as usize)
            .map(|(dir, file)| (dir.as_path(), file.clone()))
            .unwrap_or((Path::new(""), OsString::new()));

        SrcLoc {
            dir: dir.to_path_buf(),
            file,
            line: (row.line != 0).then_some(row.line),
            // If row.line is specified then row.column always has meaning.
            column: (row.line != 0).then_some(row.column),
            addr: row.address,
        }
    }

    /// Find the location of the row covering `probe`.
    pub(super) fn find_location(&self, probe: Addr) -> Option<SrcLoc> {
        let seq_idx = self.sequences.binary_search_by(|sequence| {
            if probe < sequence.start {
                Ordering::Greater
            } else if probe >= sequence.end {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        });
        let sequence = &self.sequences[seq_idx.ok()?];

        let idx = sequence
            .rows
            .binary_search_by(|row| row.address.cmp(&probe));
        let idx = match idx {
            Ok(x) => x,
            Err(0) => return None,
            Err(x) => x - 1,
        };
        Some(self.row_location(&sequence.rows[idx]))
    }
}

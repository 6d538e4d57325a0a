use anyhow::Context;
use core::fmt::{Debug, Formatter};
use std::io::Cursor;
use std::path::PathBuf;
use std::{fs, io};

/// Where the partition image of a package comes from.
#[derive(Clone)]
pub enum FileDataSource {
    File(PathBuf),
    Data(Vec<u8>),
}

impl Debug for FileDataSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            FileDataSource::File(file) => {
                f.write_fmt(format_args!("image source: File {}", file.display()))
            }
            FileDataSource::Data(d) => {
                f.write_fmt(format_args!("image source: {} raw bytes", d.len()))
            }
        }
    }
}

impl FileDataSource {
    pub fn len(&self) -> anyhow::Result<u64> {
        Ok(match self {
            FileDataSource::File(path) => fs::metadata(path)
                .with_context(|| format!("failed to read metadata of image `{}`", path.display()))?
                .len(),
            FileDataSource::Data(v) => v.len() as u64,
        })
    }

    pub fn copy_to(&self, target: &mut dyn io::Write) -> anyhow::Result<u64> {
        let copied = match self {
            FileDataSource::File(file_path) => io::copy(
                &mut fs::File::open(file_path).with_context(|| {
                    format!("failed to open image `{}` for copying", file_path.display())
                })?,
                target,
            )?,
            FileDataSource::Data(contents) => io::copy(&mut Cursor::new(contents), target)?,
        };
        Ok(copied)
    }
}

// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The frame spool and its filename protocol.
//!
//! Sampled frames live in one flat memory-backed directory shared by three
//! parties: the frame producer (writer), the per-camera watcher, and the
//! object-detector process. A frame's processing stage is encoded in its
//! extension, and every stage transition is a same-directory rename, which is
//! atomic: whoever wins the rename owns the frame. No other locking exists.
//!
//! Legal progression per frame:
//!
//! ```text
//! .tmp → .rec → .wch → (deleted)                       no motion
//!                    → .obj.wait → .obj.start → .obj.none
//!                                             → .obj.found (+ .obj.found.info)
//! ```
//!
//! The producing stage of a terminal tag is responsible for deletion; the
//! watcher cleans the whole family on timeout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base::strutil;
use base::{err, Error};
use tracing::warn;

/// Processing-stage tags, in progression order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tag {
    /// Written by the producer (after an atomic rename from `.tmp`).
    Rec,

    /// Claimed by the watcher.
    Wch,

    /// Motion confirmed; awaiting the object detector.
    ObjWait,

    /// Claimed by the object detector (detector-private).
    ObjStart,

    /// Objects found; a `.obj.found.info` sidecar holds the report.
    ObjFound,

    /// No objects found.
    ObjNone,
}

pub const ALL_TAGS: [Tag; 6] = [
    Tag::Rec,
    Tag::Wch,
    Tag::ObjWait,
    Tag::ObjStart,
    Tag::ObjFound,
    Tag::ObjNone,
];

/// Suffix of the report sidecar next to a `.obj.found` frame.
pub const INFO_SUFFIX: &str = ".obj.found.info";

/// Suffix frames carry while the producer is still writing them.
pub const TMP_SUFFIX: &str = ".tmp";

impl Tag {
    pub fn suffix(self) -> &'static str {
        match self {
            Tag::Rec => ".rec",
            Tag::Wch => ".wch",
            Tag::ObjWait => ".obj.wait",
            Tag::ObjStart => ".obj.start",
            Tag::ObjFound => ".obj.found",
            Tag::ObjNone => ".obj.none",
        }
    }
}

/// The identity of a frame: `{camera}_{index}_{label}` plus a [`Tag`].
///
/// The label is the index in base-36; camera names may themselves contain
/// underscores, so parsing takes the *last* two `_`-separated fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameName {
    pub camera: String,
    pub index: u64,
    pub label: String,
}

impl FrameName {
    pub fn new(camera: &str, index: u64) -> Self {
        FrameName {
            camera: camera.to_owned(),
            index,
            label: strutil::encode_base36(index),
        }
    }

    /// Parses a spool file name into its identity and tag. Returns `None` for
    /// foreign files (including `.tmp` ones still owned by the producer).
    pub fn parse(file_name: &str) -> Option<(FrameName, Tag)> {
        // Longest suffixes first so `.obj.wait` isn't shadowed by `.rec`-style
        // single-extension logic.
        let tag = [
            Tag::ObjStart,
            Tag::ObjFound,
            Tag::ObjWait,
            Tag::ObjNone,
            Tag::Rec,
            Tag::Wch,
        ]
        .into_iter()
        .find(|t| file_name.ends_with(t.suffix()))?;
        let stem = &file_name[..file_name.len() - tag.suffix().len()];
        let mut it = stem.rsplitn(3, '_');
        let label = it.next()?;
        let index = it.next()?.parse::<u64>().ok()?;
        let camera = it.next()?;
        if camera.is_empty() || strutil::decode_base36(label) != Some(index) {
            return None;
        }
        Some((
            FrameName {
                camera: camera.to_owned(),
                index,
                label: label.to_owned(),
            },
            tag,
        ))
    }

    pub fn stem(&self) -> String {
        format!("{}_{}_{}", self.camera, self.index, self.label)
    }

    pub fn file_name(&self, tag: Tag) -> String {
        format!("{}{}", self.stem(), tag.suffix())
    }

    pub fn path(&self, dir: &Path, tag: Tag) -> PathBuf {
        dir.join(self.file_name(tag))
    }

    pub fn info_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}{}", self.stem(), INFO_SUFFIX))
    }
}

/// Glob pattern matching one camera's frames with the given tag.
pub fn camera_glob(dir: &Path, camera: &str, tag: Tag) -> String {
    format!("{}/{}_*{}", dir.display(), camera, tag.suffix())
}

/// Glob pattern matching every camera's frames with the given tag.
pub fn any_glob(dir: &Path, tag: Tag) -> String {
    format!("{}/*{}", dir.display(), tag.suffix())
}

/// Derives the tagless stem of a spool path.
fn split_tagged(path: &Path) -> Option<(PathBuf, String, Tag)> {
    let file_name = path.file_name()?.to_str()?;
    let (name, tag) = FrameName::parse(file_name)?;
    Some((path.parent()?.to_owned(), name.stem(), tag))
}

/// Advances a frame to `to` by atomic rename.
///
/// Returns the new path, or `None` if the source vanished first (another
/// stage won the race); any other failure is an error.
pub fn retag(path: &Path, to: Tag) -> Result<Option<PathBuf>, Error> {
    let (dir, stem, from) = split_tagged(path)
        .ok_or_else(|| err!(InvalidArgument, msg("not a spool path: {}", path.display())))?;
    if from == to {
        return Ok(Some(path.to_owned()));
    }
    let target = dir.join(format!("{stem}{}", to.suffix()));
    match fs::rename(path, &target) {
        Ok(()) => Ok(Some(target)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(err!(
            Unknown,
            msg("rename {} -> {}", path.display(), target.display()),
            source(e)
        )),
    }
}

/// Removes every remaining file of a frame's family: all tags plus the info
/// sidecar. Individual failures are logged and skipped.
pub fn remove_family(dir: &Path, name: &FrameName) -> usize {
    let mut removed = 0;
    let mut paths: Vec<PathBuf> = ALL_TAGS.iter().map(|t| name.path(dir, *t)).collect();
    paths.push(name.info_path(dir));
    for p in paths {
        match fs::remove_file(&p) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %p.display(), err = %e, "can't delete spool file"),
        }
    }
    removed
}

/// Publishes frame bytes atomically: write `.tmp`, then rename to `.rec`.
pub fn publish_frame(dir: &Path, name: &FrameName, bytes: &[u8]) -> Result<PathBuf, Error> {
    let tmp = dir.join(format!("{}{}", name.stem(), TMP_SUFFIX));
    fs::write(&tmp, bytes)
        .map_err(|e| err!(Unknown, msg("write {}", tmp.display()), source(e)))?;
    let rec = name.path(dir, Tag::Rec);
    fs::rename(&tmp, &rec)
        .map_err(|e| err!(Unknown, msg("publish {}", rec.display()), source(e)))?;
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        let n = FrameName::new("cam0", 1296);
        assert_eq!(n.file_name(Tag::Rec), "cam0_1296_10.rec");
        for tag in ALL_TAGS {
            let (parsed, t) = FrameName::parse(&n.file_name(tag)).unwrap();
            assert_eq!(parsed, n);
            assert_eq!(t, tag);
        }
    }

    #[test]
    fn parse_supports_underscored_camera_names() {
        let n = FrameName::new("front_door", 7);
        let (parsed, tag) = FrameName::parse(&n.file_name(Tag::ObjWait)).unwrap();
        assert_eq!(parsed.camera, "front_door");
        assert_eq!(parsed.index, 7);
        assert_eq!(tag, Tag::ObjWait);
    }

    #[test]
    fn parse_rejects_foreign_files() {
        assert_eq!(FrameName::parse("snapshot.jpg"), None);
        assert_eq!(FrameName::parse("cam0_12_c.tmp"), None);
        assert_eq!(FrameName::parse("cam0_notanum_x.rec"), None);
        // label inconsistent with index
        assert_eq!(FrameName::parse("cam0_12_zz.rec"), None);
        assert_eq!(FrameName::parse("_12_c.rec"), None);
    }

    #[test]
    fn retag_progression() {
        let dir = tempfile::tempdir().unwrap();
        let n = FrameName::new("cam0", 3);
        let rec = publish_frame(dir.path(), &n, b"jpegish").unwrap();
        assert!(rec.ends_with("cam0_3_3.rec"));

        let wch = retag(&rec, Tag::Wch).unwrap().unwrap();
        assert!(wch.exists());
        assert!(!rec.exists());

        // Claiming again reports the frame as lost rather than erroring.
        assert_eq!(retag(&rec, Tag::Wch).unwrap(), None);

        let wait = retag(&wch, Tag::ObjWait).unwrap().unwrap();
        assert_eq!(wait, n.path(dir.path(), Tag::ObjWait));
    }

    #[test]
    fn remove_family_removes_exactly_the_family() {
        let dir = tempfile::tempdir().unwrap();
        let n = FrameName::new("cam0", 9);
        fs::write(n.path(dir.path(), Tag::ObjFound), b"x").unwrap();
        fs::write(n.info_path(dir.path()), b"{}").unwrap();
        let other = FrameName::new("cam0", 10);
        fs::write(other.path(dir.path(), Tag::Rec), b"y").unwrap();

        assert_eq!(remove_family(dir.path(), &n), 2);
        assert!(other.path(dir.path(), Tag::Rec).exists());
        assert_eq!(remove_family(dir.path(), &n), 0);
    }

    #[test]
    fn globs() {
        let dir = PathBuf::from("/dev/shm/vigil");
        assert_eq!(
            camera_glob(&dir, "cam0", Tag::Rec),
            "/dev/shm/vigil/cam0_*.rec"
        );
        assert_eq!(any_glob(&dir, Tag::ObjWait), "/dev/shm/vigil/*.obj.wait");
    }
}

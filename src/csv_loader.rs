//! マニフェスト（CSV）からのデータセット読み込み
//!
//! 列構成: `[相対画像パス, ラベル, サブセットタグ]`（ヘッダー行は無視）

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim};
use std::fs::File;
use std::path::{Component, Path, PathBuf};

use crate::error::{ClassifierError, Result};
use crate::types::ImageRecord;

/// 1レコードに必要な列数
pub const MANIFEST_COLUMNS: usize = 3;

/// マニフェストの読み込み設定
///
/// マニフェストは不変の入力として扱うため、`records()` は何度呼んでも同じ列を返す。
#[derive(Debug, Clone)]
pub struct ManifestReader {
    manifest_path: PathBuf,
    image_root: PathBuf,
    strip_components: usize,
}

impl ManifestReader {
    pub fn new(manifest_path: impl Into<PathBuf>, image_root: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            image_root: image_root.into(),
            strip_components: 0,
        }
    }

    /// 相対パスの先頭から取り除く要素数を指定
    ///
    /// 例: `image/0001.jpg` を `strip_components = 1` で `<root>/0001.jpg` に解決
    pub fn with_strip_components(mut self, strip_components: usize) -> Self {
        self.strip_components = strip_components;
        self
    }

    /// マニフェストを開き、レコードを遅延的に返すイテレータを作成
    pub fn records(&self) -> Result<ManifestRecords> {
        let file = File::open(&self.manifest_path)?;
        let reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(file);

        Ok(ManifestRecords {
            inner: reader.into_records(),
            image_root: self.image_root.clone(),
            strip_components: self.strip_components,
        })
    }

    pub fn image_root(&self) -> &Path {
        &self.image_root
    }
}

/// マニフェストのレコードイテレータ
pub struct ManifestRecords {
    inner: StringRecordsIntoIter<File>,
    image_root: PathBuf,
    strip_components: usize,
}

impl Iterator for ManifestRecords {
    type Item = Result<ImageRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.inner.next()? {
            Ok(record) => record,
            Err(e) => return Some(Err(csv_error(e))),
        };
        Some(parse_record(&record, &self.image_root, self.strip_components))
    }
}

fn parse_record(record: &StringRecord, image_root: &Path, strip_components: usize) -> Result<ImageRecord> {
    if record.len() < MANIFEST_COLUMNS {
        return Err(ClassifierError::ManifestFormat {
            line: record.position().map(|p| p.line()).unwrap_or(0),
            expected: MANIFEST_COLUMNS,
            found: record.len(),
        });
    }

    // 列数は上で確認済み
    let relative = &record[0];
    let label = &record[1];
    let subset = &record[2];

    Ok(ImageRecord {
        path: resolve_image_path(image_root, relative, strip_components),
        label: non_empty(label),
        subset: non_empty(subset),
    })
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn csv_error(e: csv::Error) -> ClassifierError {
    match e.into_kind() {
        csv::ErrorKind::Io(io) => ClassifierError::Io(io),
        other => ClassifierError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{:?}", other),
        )),
    }
}

/// 相対パスを画像ルートに対して解決
///
/// `strip_components` は先頭の通常要素にだけ適用し、`..` 以降は取り除かない。
pub fn resolve_image_path(image_root: &Path, relative: &str, strip_components: usize) -> PathBuf {
    let relative = Path::new(relative);
    if relative.is_absolute() {
        return relative.to_path_buf();
    }

    let mut remaining = strip_components;
    let mut resolved = image_root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(_) if remaining > 0 => remaining -= 1,
            Component::ParentDir => {
                remaining = 0;
                resolved.push(component);
            }
            _ => resolved.push(component),
        }
    }
    resolved
}

/// マニフェスト全体を読み込む
pub fn load_manifest(manifest_path: &Path, image_root: &Path, strip_components: usize) -> Result<Vec<ImageRecord>> {
    ManifestReader::new(manifest_path, image_root)
        .with_strip_components(strip_components)
        .records()?
        .collect()
}

/// 指定したサブセットタグのレコードのみを取り出す
pub fn records_for_subset<'a>(
    records: &'a [ImageRecord],
    tag: &'a str,
) -> impl Iterator<Item = &'a ImageRecord> + 'a {
    records
        .iter()
        .filter(move |record| record.subset.as_deref() == Some(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("index.csv");
        let mut file = File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_resolves_paths_and_skips_header() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(
            dir.path(),
            "image,class,subset\nimage/0.jpeg,dent,T\nimage/1.jpeg,scratch,V\n",
        );

        let records = load_manifest(&manifest, Path::new("/data/images"), 1).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, PathBuf::from("/data/images/0.jpeg"));
        assert_eq!(records[0].label.as_deref(), Some("dent"));
        assert_eq!(records[1].subset.as_deref(), Some("V"));
    }

    #[test]
    fn test_short_record_is_manifest_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path(), "image,class,subset\na.jpg,dent,T\nb.jpg,dent\n");

        let err = load_manifest(&manifest, dir.path(), 0).unwrap_err();
        match err {
            ClassifierError::ManifestFormat { line, expected, found } => {
                assert_eq!(line, 3);
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_records_are_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path(), "p,l,s\na.jpg,dent,T\nb.jpg,glass,T\n");
        let reader = ManifestReader::new(&manifest, dir.path());

        let first: Vec<_> = reader.records().unwrap().collect::<Result<_>>().unwrap();
        let second: Vec<_> = reader.records().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_records_for_subset() {
        let mut records = vec![
            ImageRecord::labeled("a.jpg", "dent"),
            ImageRecord::labeled("b.jpg", "dent"),
            ImageRecord::labeled("c.jpg", "scratch"),
        ];
        records[0].subset = Some("T".into());
        records[1].subset = Some("V".into());
        records[2].subset = Some("T".into());

        let train: Vec<_> = records_for_subset(&records, "T").collect();
        assert_eq!(train.len(), 2);
        assert_eq!(train[1].path, PathBuf::from("c.jpg"));
        assert_eq!(records_for_subset(&records, "X").count(), 0);
    }

    #[test]
    fn test_resolve_without_strip() {
        let path = resolve_image_path(Path::new("/root"), "image/a.jpg", 0);
        assert_eq!(path, PathBuf::from("/root/image/a.jpg"));
    }

    #[test]
    fn test_resolve_keeps_parent_dir() {
        let path = resolve_image_path(Path::new("/data/images"), "../other/a.jpg", 0);
        assert_eq!(path, PathBuf::from("/data/images/../other/a.jpg"));

        // 先頭の `..` の後ろは取り除かない
        let path = resolve_image_path(Path::new("/data/images"), "../other/a.jpg", 1);
        assert_eq!(path, PathBuf::from("/data/images/../other/a.jpg"));

        let path = resolve_image_path(Path::new("/data/images"), "image/../b.jpg", 1);
        assert_eq!(path, PathBuf::from("/data/images/../b.jpg"));
    }
}

//! 埋め込みベクトルのディスクキャッシュ
//!
//! キーは (バックボーン識別子, 画像パス, 画像内容のハッシュ) から生成するため、
//! 画像や設定が変わると別のキーになり、古い埋め込みが再利用されることはありません。
//! エントリはキーごとに1ファイルで、一時ファイルに書いてから rename します。

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::ml::backbone::Embedding;

const MAGIC: &[u8; 4] = b"EMB1";

/// キャッシュキー（16進文字列）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// ディスク上の埋め込みキャッシュ
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    dir: PathBuf,
}

impl EmbeddingCache {
    /// キャッシュディレクトリを作成して開く
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key(backbone_identity: &str, image_path: &Path, content_fingerprint: &str) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        for field in [
            backbone_identity.as_bytes(),
            image_path.as_os_str().as_encoded_bytes(),
            content_fingerprint.as_bytes(),
        ] {
            // 長さを前置して区切りの曖昧さをなくす
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        CacheKey(hasher.finalize().to_hex().to_string())
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.emb", key.as_str()))
    }

    /// キャッシュを参照（無い・壊れている場合は None）
    pub fn get(&self, key: &CacheKey, expected_dim: usize) -> Option<Embedding> {
        let path = self.entry_path(key);
        let bytes = fs::read(&path).ok()?;
        match decode_entry(&bytes, expected_dim) {
            Some(embedding) => Some(embedding),
            None => {
                tracing::warn!("ignoring corrupt embedding cache entry {}", path.display());
                None
            }
        }
    }

    /// キャッシュに書き込む
    pub fn put(&self, key: &CacheKey, embedding: &Embedding) -> Result<()> {
        let path = self.entry_path(key);
        let tmp_path = self.dir.join(format!(
            ".{}.{}.{:?}.tmp",
            key.as_str(),
            std::process::id(),
            std::thread::current().id()
        ));

        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&encode_entry(embedding))?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// 全エントリを削除
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("emb") {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn encode_entry(embedding: &Embedding) -> Vec<u8> {
    let values = embedding.as_slice();
    let mut bytes = Vec::with_capacity(8 + values.len() * 4);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_entry(bytes: &[u8], expected_dim: usize) -> Option<Embedding> {
    if bytes.len() < 8 || &bytes[..4] != MAGIC {
        return None;
    }
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if len != expected_dim || bytes.len() != 8 + len * 4 {
        return None;
    }
    let values = bytes[8..]
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Some(Embedding::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::open(dir.path().join("cache")).unwrap();
        let key = EmbeddingCache::key("conv3-gap-abc", Path::new("/img/0.jpg"), "deadbeef");
        let embedding = Embedding::new(vec![0.1, -2.5, f32::MIN_POSITIVE, 3.0e7]);

        assert!(cache.get(&key, 4).is_none());
        cache.put(&key, &embedding).unwrap();
        assert_eq!(cache.get(&key, 4), Some(embedding));
    }

    #[test]
    fn test_key_depends_on_backbone_path_and_content() {
        let base = EmbeddingCache::key("b1", Path::new("a.jpg"), "c1");
        assert_eq!(base, EmbeddingCache::key("b1", Path::new("a.jpg"), "c1"));
        assert_ne!(base, EmbeddingCache::key("b2", Path::new("a.jpg"), "c1"));
        assert_ne!(base, EmbeddingCache::key("b1", Path::new("b.jpg"), "c1"));
        assert_ne!(base, EmbeddingCache::key("b1", Path::new("a.jpg"), "c2"));
    }

    #[test]
    fn test_key_field_boundaries_do_not_collide() {
        let a = EmbeddingCache::key("ab", Path::new("c"), "d");
        let b = EmbeddingCache::key("a", Path::new("bc"), "d");
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_corrupt_or_mismatched_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::open(dir.path()).unwrap();
        let key = EmbeddingCache::key("b", Path::new("a.jpg"), "c");

        cache.put(&key, &Embedding::new(vec![1.0, 2.0])).unwrap();
        assert!(cache.get(&key, 3).is_none());

        fs::write(cache.entry_path(&key), b"EMB1garbage").unwrap();
        assert!(cache.get(&key, 2).is_none());
    }

    #[test]
    fn test_clear_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::open(dir.path()).unwrap();
        for name in ["a.jpg", "b.jpg"] {
            let key = EmbeddingCache::key("b", Path::new(name), "c");
            cache.put(&key, &Embedding::new(vec![1.0])).unwrap();
        }
        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.clear().unwrap(), 0);
    }
}

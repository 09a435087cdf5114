//! In-memory registry for pipeline tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image_creator_oci::manifest::{
    sha256_digest, Descriptor, ResolvedManifest, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_MANIFEST,
};
use image_creator_oci::{BlobReader, ImageRef, ImageSource, OciError, Transport};

pub const LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// A gzip-compressed layer and the digest of its uncompressed tar.
#[derive(Clone)]
pub struct Layer {
    pub compressed: Vec<u8>,
    pub diff_id: String,
}

/// Build a layer holding `files` as `(path, contents)` pairs.
pub fn layer(files: &[(&str, &str)]) -> Layer {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append(&header, contents.as_bytes()).unwrap();
    }
    let plain = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&plain).unwrap();
    Layer {
        compressed: encoder.finish().unwrap(),
        diff_id: sha256_digest(&plain),
    }
}

struct FakeImage {
    manifest: ResolvedManifest,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    blob_fetches: AtomicUsize,
}

/// A [`Transport`] serving images from memory, keyed by `repository:tag`.
#[derive(Default)]
pub struct FakeRegistry {
    images: HashMap<String, Arc<FakeImage>>,
    counters: Arc<Counters>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve an image under `name` (familiar form, e.g. `alpine:3.19`).
    pub fn with_image(mut self, name: &str, layers: &[Layer]) -> Self {
        let diff_ids: Vec<&str> = layers.iter().map(|l| l.diff_id.as_str()).collect();
        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Labels": {"name": name}},
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
        }))
        .unwrap();

        let mut blobs = HashMap::new();
        let config_desc = descriptor(MEDIA_TYPE_OCI_CONFIG, &config);
        blobs.insert(config_desc.digest.clone(), config);
        let mut layer_descs = Vec::new();
        for layer in layers {
            let desc = descriptor(LAYER_GZIP, &layer.compressed);
            blobs.insert(desc.digest.clone(), layer.compressed.clone());
            layer_descs.push(desc);
        }

        let raw = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": config_desc,
            "layers": layer_descs,
        }))
        .unwrap();
        let manifest = ResolvedManifest::from_raw(raw, Some(MEDIA_TYPE_OCI_MANIFEST)).unwrap();
        self.images
            .insert(name.to_string(), Arc::new(FakeImage { manifest, blobs }));
        self
    }

    /// How many times a source was opened.
    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// How many blobs were read.
    pub fn blob_fetches(&self) -> usize {
        self.counters.blob_fetches.load(Ordering::SeqCst)
    }
}

fn descriptor(media_type: &str, data: &[u8]) -> Descriptor {
    Descriptor {
        media_type: media_type.to_string(),
        digest: sha256_digest(data),
        size: data.len() as u64,
        platform: None,
        annotations: None,
    }
}

#[async_trait]
impl Transport for FakeRegistry {
    async fn open(&self, image: &ImageRef) -> image_creator_oci::Result<Box<dyn ImageSource>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let name = image.tagged_name();
        let found = self
            .images
            .get(&name)
            .ok_or_else(|| OciError::NotFound(format!("manifest unknown: {}", name)))?;
        Ok(Box::new(FakeSource {
            name,
            image: Arc::clone(found),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct FakeSource {
    name: String,
    image: Arc<FakeImage>,
    counters: Arc<Counters>,
}

#[async_trait]
impl ImageSource for FakeSource {
    fn describe(&self) -> String {
        format!("fake://{}", self.name)
    }

    async fn manifest(&self) -> image_creator_oci::Result<ResolvedManifest> {
        Ok(self.image.manifest.clone())
    }

    async fn blob(&self, desc: &Descriptor) -> image_creator_oci::Result<BlobReader> {
        self.counters.blob_fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .image
            .blobs
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| OciError::NotFound(desc.digest.clone()))?;
        Ok(Box::pin(Cursor::new(data)))
    }
}

/// Every entry of a tar archive on disk, by name.
pub fn read_archive(path: &std::path::Path) -> HashMap<String, Vec<u8>> {
    use std::io::Read;

    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(file);
    let mut entries = HashMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().to_string();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        assert!(
            entries.insert(name.clone(), body).is_none(),
            "duplicate archive entry {}",
            name
        );
    }
    entries
}

/// Names of the files inside a layer tarball.
pub fn layer_files(layer_tar: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(layer_tar);
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect()
}

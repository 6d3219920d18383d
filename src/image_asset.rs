use serde_json::{json, Value};

pub type AssetId = i64;

/// The box a thumbnail was requested for. Current callers always ask for
/// squares (`landscape_thumb(n)` -> `n x n`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThumbSize {
    pub width: u32,
    pub height: u32,
}

impl ThumbSize {
    pub fn square(size: u32) -> Self {
        ThumbSize {
            width: size,
            height: size,
        }
    }
}

/// Present only on derived thumbnails: the original they were made from and
/// the size that was asked for (the real size may be smaller, aspect ratio
/// is preserved).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Derivation {
    pub parent_id: AssetId,
    pub requested: ThumbSize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageAsset {
    pub id: AssetId,
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub derivation: Option<Derivation>,
}

impl ImageAsset {
    pub fn is_original(&self) -> bool {
        self.derivation.is_none()
    }

    pub fn parent_id(&self) -> Option<AssetId> {
        self.derivation.map(|x| x.parent_id)
    }

    pub fn url(&self, cdn: Option<&str>) -> String {
        match cdn {
            Some(cdn) => format!("https://{}/{}", cdn, self.key),
            None => format!("https://{}.s3.amazonaws.com/{}", self.bucket, self.key),
        }
    }

    pub fn to_json(&self, cdn: Option<&str>, parent: Option<&ImageAsset>) -> Value {
        let mut data = json!({
            "url": self.url(cdn),
            "width": self.width,
            "height": self.height,
            "size": self.size,
        });
        if let Some(parent) = parent {
            data["parent"] = parent.to_json(cdn, None);
        }
        data
    }
}

/// A row that is about to be inserted; the id is assigned by the repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewImageAsset {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub derivation: Option<Derivation>,
}

impl NewImageAsset {
    pub fn with_id(self, id: AssetId) -> ImageAsset {
        ImageAsset {
            id,
            bucket: self.bucket,
            key: self.key,
            size: self.size,
            width: self.width,
            height: self.height,
            derivation: self.derivation,
        }
    }
}

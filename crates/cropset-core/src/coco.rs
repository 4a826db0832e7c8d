//! COCO-style datasets: the detection dataset we read and the
//! classification datasets we produce.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};

/// Image identifier as found in the input JSON. Camera-trap datasets use
/// both integer and string ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageId {
    Num(i64),
    Text(String),
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageId::Num(n) => write!(f, "{n}"),
            ImageId::Text(s) => f.write_str(s),
        }
    }
}

/// Value of the location key of an image, in canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LocationId(pub String);

impl LocationId {
    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Null => None,
            Value::String(s) => Some(LocationId(s.clone())),
            other => Some(LocationId(other.to_string())),
        }
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputCategory {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputImage {
    pub id: ImageId,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    /// Everything else, including the location key.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InputImage {
    pub fn location(&self, key: &str) -> Option<LocationId> {
        self.extra.get(key).and_then(LocationId::from_value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAnnotation {
    pub image_id: ImageId,
    pub category_id: i64,
}

/// The detection dataset the pipeline consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct InputDataset {
    pub categories: Vec<InputCategory>,
    pub images: Vec<InputImage>,
    #[serde(default)]
    pub annotations: Vec<InputAnnotation>,
}

impl InputDataset {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(PipelineError::io(path))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| PipelineError::InputJson {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Distinct ground-truth category ids per image.
    pub fn categories_by_image(&self) -> HashMap<&ImageId, BTreeSet<i64>> {
        let mut out: HashMap<&ImageId, BTreeSet<i64>> = HashMap::new();
        for ann in &self.annotations {
            out.entry(&ann.image_id).or_default().insert(ann.category_id);
        }
        out
    }

    /// Images in ascending id order.
    pub fn sorted_images(&self) -> Vec<&InputImage> {
        let mut images: Vec<&InputImage> = self.images.iter().collect();
        images.sort_by(|a, b| a.id.cmp(&b.id));
        images
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: u32,
    pub name: String,
    pub supercategory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u32,
}

/// One output split.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CocoDataset {
    pub images: Vec<ImageEntry>,
    pub categories: Vec<Category>,
    pub annotations: Vec<AnnotationEntry>,
}

impl CocoDataset {
    pub fn with_categories(categories: Vec<Category>) -> Self {
        Self { categories, ..Default::default() }
    }

    pub fn category(&self, id: u32) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }
}

/// Input categories re-numbered densely from 0, in input order.
#[derive(Debug, Clone)]
pub struct CategoryTable {
    categories: Vec<Category>,
    by_input_id: HashMap<i64, usize>,
}

impl CategoryTable {
    pub fn from_input(input: &[InputCategory]) -> Self {
        let mut categories = Vec::with_capacity(input.len());
        let mut by_input_id = HashMap::with_capacity(input.len());
        for cat in input {
            if by_input_id.contains_key(&cat.id) {
                continue;
            }
            by_input_id.insert(cat.id, categories.len());
            categories.push(Category {
                id: categories.len() as u32,
                name: cat.name.clone(),
                supercategory: "entity".into(),
            });
        }
        Self { categories, by_input_id }
    }

    pub fn lookup(&self, input_id: i64) -> Result<&Category> {
        self.by_input_id
            .get(&input_id)
            .map(|&i| &self.categories[i])
            .ok_or(PipelineError::UnknownCategoryId(input_id))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.categories.iter().any(|c| c.name == name)
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }
}

//! Page compositing
//!
//! Compositing is split in two so pages can be worked on in parallel without
//! sharing the `lopdf::Document`:
//!
//! 1. [`PageSnapshot::capture`] copies everything a page needs (inherited page
//!    box, rotation, resources, contents) out of the document.
//! 2. [`composite`] turns a snapshot into a [`PageComposite`]: the underlay
//!    content stream plus the page's new `/Resources` and `/Contents`. This is
//!    the per-page task handed to workers.
//! 3. [`PageComposite::apply`] writes the result back into the document.

use crate::error::CompositeError;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

/// Page tree depth beyond which inherited attribute lookup gives up.
const MAX_TREE_DEPTH: usize = 64;

/// Reference chains longer than this are treated as broken.
const MAX_REFERENCE_HOPS: usize = 32;

/// Visible page rectangle in default user space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageBox {
    pub x0: f32,
    pub y0: f32,
    pub width: f32,
    pub height: f32,
}

impl PageBox {
    pub fn new(x0: f32, y0: f32, width: f32, height: f32) -> Self {
        Self {
            x0,
            y0,
            width,
            height,
        }
    }

    /// Parse a `[llx lly urx ury]` rectangle. Corners may be given in any order.
    fn from_rect(obj: &Object) -> Option<Self> {
        let arr = match obj {
            Object::Array(arr) if arr.len() == 4 => arr,
            _ => return None,
        };
        let nums: Vec<f32> = arr.iter().filter_map(number).collect();
        if nums.len() != 4 {
            return None;
        }
        let (x0, x1) = (nums[0].min(nums[2]), nums[0].max(nums[2]));
        let (y0, y1) = (nums[1].min(nums[3]), nums[1].max(nums[3]));
        Some(Self::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Where the watermark lands on a page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Placement {
    /// One third of the page on each axis, centred. Aspect ratio is not kept.
    pub fn for_page(page: &PageBox) -> Self {
        let width = page.width / 3.0;
        let height = page.height / 3.0;
        Self {
            x: page.x0 + (page.width - width) / 2.0,
            y: page.y0 + (page.height - height) / 2.0,
            width,
            height,
        }
    }

    /// `cm` operands mapping the image unit square onto this rectangle.
    ///
    /// `rotation` is the page's `/Rotate` (0, 90, 180 or 270). The image is
    /// turned against it so it reads upright in a viewer while covering the
    /// same rectangle.
    pub fn matrix(&self, rotation: u16) -> Matrix {
        let (x, y, w, h) = (self.x, self.y, self.width, self.height);
        match rotation {
            90 => Matrix::new(0.0, h, -w, 0.0, x + w, y),
            180 => Matrix::new(-w, 0.0, 0.0, -h, x + w, y + h),
            270 => Matrix::new(0.0, -h, w, 0.0, x, y + h),
            _ => Matrix::new(w, 0.0, 0.0, h, x, y),
        }
    }
}

/// 2D transformation matrix [a, b, c, d, e, f]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Matrix {
    pub fn new(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Matrix { a, b, c, d, e, f }
    }

    /// Map a point through the matrix.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    fn operands(&self) -> Vec<Object> {
        [self.a, self.b, self.c, self.d, self.e, self.f]
            .into_iter()
            .map(Object::Real)
            .collect()
    }
}

/// Everything needed to composite one page, copied out of the document.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    /// Zero-based page index.
    pub index: usize,
    pub page_id: ObjectId,
    media_box: Option<Object>,
    crop_box: Option<Object>,
    rotate: Option<Object>,
    resources: Option<Object>,
    contents: Option<Object>,
}

impl PageSnapshot {
    /// Copy the attributes of `page_id` out of `doc`, following `/Parent` for
    /// inherited ones and resolving references.
    pub fn capture(doc: &Document, index: usize, page_id: ObjectId) -> Self {
        let mut snapshot = Self {
            index,
            page_id,
            media_box: None,
            crop_box: None,
            rotate: None,
            resources: None,
            contents: None,
        };

        let page = match doc.get_object(page_id) {
            Ok(Object::Dictionary(dict)) => dict,
            _ => return snapshot,
        };

        snapshot.media_box = inherited(doc, page, b"MediaBox").map(|b| resolve_array(doc, b));
        snapshot.crop_box = inherited(doc, page, b"CropBox").map(|b| resolve_array(doc, b));
        snapshot.rotate = inherited(doc, page, b"Rotate").cloned();
        snapshot.resources = inherited(doc, page, b"Resources").map(|obj| match obj {
            Object::Dictionary(dict) => {
                let mut dict = dict.clone();
                let xobjects = dict
                    .get(b"XObject")
                    .ok()
                    .and_then(|x| resolve(doc, x))
                    .cloned();
                if let Some(xobjects) = xobjects {
                    dict.set("XObject", xobjects);
                }
                Object::Dictionary(dict)
            }
            other => other.clone(),
        });
        // An indirect array is inlined so its stream references can be spliced
        // after the underlay.
        snapshot.contents = page.get(b"Contents").ok().map(|obj| match resolve(doc, obj) {
            Some(Object::Array(items)) => Object::Array(items.clone()),
            _ => obj.clone(),
        });

        snapshot
    }

    /// The rectangle the watermark is centred in: CropBox when valid,
    /// otherwise MediaBox.
    pub fn page_box(&self) -> Result<PageBox, CompositeError> {
        let page_box = self
            .crop_box
            .as_ref()
            .and_then(PageBox::from_rect)
            .or_else(|| self.media_box.as_ref().and_then(PageBox::from_rect))
            .ok_or_else(|| CompositeError::new(self.index, "page has no valid MediaBox"))?;

        if page_box.width <= 0.0 || page_box.height <= 0.0 {
            return Err(CompositeError::new(
                self.index,
                format!("page box is empty ({}x{})", page_box.width, page_box.height),
            ));
        }
        Ok(page_box)
    }

    /// Normalized `/Rotate`: 0, 90, 180 or 270.
    pub fn rotation(&self) -> Result<u16, CompositeError> {
        let raw = match &self.rotate {
            None => return Ok(0),
            Some(Object::Integer(n)) => *n,
            Some(Object::Real(n)) if n.fract() == 0.0 => *n as i64,
            Some(other) => {
                return Err(CompositeError::new(
                    self.index,
                    format!("invalid /Rotate {:?}", other),
                ))
            }
        };
        if raw % 90 != 0 {
            return Err(CompositeError::new(
                self.index,
                format!("/Rotate {} is not a multiple of 90", raw),
            ));
        }
        Ok(raw.rem_euclid(360) as u16)
    }
}

/// The result of compositing one page, ready to be written back.
#[derive(Debug, Clone)]
pub struct PageComposite {
    pub index: usize,
    pub page_id: ObjectId,
    pub placement: Placement,
    underlay: Stream,
    resources: Dictionary,
    existing_contents: Vec<Object>,
}

impl PageComposite {
    /// Raw operators of the underlay stream.
    pub fn underlay_content(&self) -> &[u8] {
        &self.underlay.content
    }

    /// Add the underlay stream to `doc` and point the page at it, ahead of its
    /// existing content.
    pub fn apply(self, doc: &mut Document) -> Result<(), CompositeError> {
        let index = self.index;
        if !matches!(doc.get_object(self.page_id), Ok(Object::Dictionary(_))) {
            return Err(CompositeError::new(index, "page object is not a dictionary"));
        }

        let underlay_id = doc.add_object(Object::Stream(self.underlay));
        let mut contents = Vec::with_capacity(self.existing_contents.len() + 1);
        contents.push(Object::Reference(underlay_id));
        contents.extend(self.existing_contents);

        let page = doc
            .get_dictionary_mut(self.page_id)
            .map_err(|e| CompositeError::new(index, e.to_string()))?;
        page.set("Contents", Object::Array(contents));
        page.set("Resources", Object::Dictionary(self.resources));
        Ok(())
    }
}

/// Composite the watermark XObject `watermark` beneath the content of one
/// page.
pub fn composite(page: &PageSnapshot, watermark: ObjectId) -> Result<PageComposite, CompositeError> {
    let page_box = page.page_box()?;
    let rotation = page.rotation()?;
    let placement = Placement::for_page(&page_box);

    let mut resources = match &page.resources {
        None => Dictionary::new(),
        Some(Object::Dictionary(dict)) => dict.clone(),
        Some(_) => {
            return Err(CompositeError::new(page.index, "/Resources is not a dictionary"));
        }
    };
    let mut xobjects = match resources.get(b"XObject") {
        Err(_) => Dictionary::new(),
        Ok(Object::Dictionary(dict)) => dict.clone(),
        Ok(_) => {
            return Err(CompositeError::new(page.index, "/XObject is not a dictionary"));
        }
    };

    let name = unused_name(&xobjects);
    xobjects.set(name.clone(), Object::Reference(watermark));
    resources.set("XObject", Object::Dictionary(xobjects));

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new("cm", placement.matrix(rotation).operands()),
            Operation::new("Do", vec![Object::Name(name.into_bytes())]),
            Operation::new("Q", vec![]),
        ],
    };
    let encoded = content
        .encode()
        .map_err(|e| CompositeError::new(page.index, format!("failed to encode content: {}", e)))?;

    let existing_contents = match &page.contents {
        None => Vec::new(),
        Some(Object::Array(items)) => items.clone(),
        Some(Object::Reference(id)) => vec![Object::Reference(*id)],
        Some(_) => {
            return Err(CompositeError::new(
                page.index,
                "/Contents is neither a stream reference nor an array",
            ));
        }
    };

    Ok(PageComposite {
        index: page.index,
        page_id: page.page_id,
        placement,
        underlay: Stream::new(Dictionary::new(), encoded),
        resources,
        existing_contents,
    })
}

/// First `WmN` name not already used by the page's XObjects.
fn unused_name(xobjects: &Dictionary) -> String {
    (0..)
        .map(|n| format!("Wm{}", n))
        .find(|name| !xobjects.has(name.as_bytes()))
        .unwrap_or_else(|| "Wm".to_string())
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(n) => Some(*n as f32),
        Object::Real(n) => Some(*n),
        _ => None,
    }
}

/// Follow a reference chain to the object it names.
fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    let mut current = obj;
    for _ in 0..MAX_REFERENCE_HOPS {
        match current {
            Object::Reference(id) => current = doc.get_object(*id).ok()?,
            other => return Some(other),
        }
    }
    None
}

/// Resolve an array and each of its elements.
fn resolve_array(doc: &Document, obj: &Object) -> Object {
    match obj {
        Object::Array(items) => Object::Array(
            items
                .iter()
                .map(|item| resolve(doc, item).cloned().unwrap_or(Object::Null))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Look up a page attribute, walking up the page tree for inherited ones.
fn inherited<'a>(doc: &'a Document, page: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    let mut node = page;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = node.get(key) {
            return resolve(doc, value);
        }
        node = match node.get(b"Parent").ok().and_then(|p| resolve(doc, p)) {
            Some(Object::Dictionary(parent)) => parent,
            _ => return None,
        };
    }
    None
}

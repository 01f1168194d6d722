//! Embedding the watermark asset into a PDF
//!
//! The asset becomes one RGB image XObject with a grayscale soft mask carrying
//! the opacity-scaled alpha. Both streams are Flate-compressed so the alpha
//! survives byte for byte. Every page references the same object.

use crate::asset::WatermarkAsset;
use crate::error::DocumentError;
use image::RgbaImage;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::io::Write;
use tracing::{debug, instrument};

/// Add the watermark image (and its soft mask) to `doc`, returning the image
/// XObject id.
#[instrument(skip_all, fields(width = asset.width(), height = asset.height()))]
pub fn embed_watermark(doc: &mut Document, asset: &WatermarkAsset) -> Result<ObjectId, DocumentError> {
    let (mut image_stream, smask_stream) =
        encode_rgba_streams(asset.image()).map_err(DocumentError::Embed)?;

    let smask_id = doc.add_object(Object::Stream(smask_stream));
    image_stream
        .dict
        .set("SMask", Object::Reference(smask_id));
    let image_id = doc.add_object(Object::Stream(image_stream));

    debug!(?image_id, ?smask_id, "Watermark embedded");
    Ok(image_id)
}

/// Split RGBA pixels into a Flate RGB stream and a Flate gray SMask stream.
fn encode_rgba_streams(rgba: &RgbaImage) -> Result<(Stream, Stream), String> {
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return Err(format!("watermark has no pixels ({}x{})", width, height));
    }

    let mut rgb_data = Vec::with_capacity(plane_len(width, height, 3));
    let mut alpha_data = Vec::with_capacity(plane_len(width, height, 1));
    for chunk in rgba.as_raw().chunks(4) {
        rgb_data.extend_from_slice(&chunk[..3]);
        alpha_data.push(chunk[3]);
    }

    let compressed_rgb = flate(&rgb_data)?;
    let compressed_alpha = flate(&alpha_data)?;

    let image_dict = image_dictionary(width, height, b"DeviceRGB", compressed_rgb.len());
    let smask_dict = image_dictionary(width, height, b"DeviceGray", compressed_alpha.len());

    Ok((
        Stream::new(image_dict, compressed_rgb),
        Stream::new(smask_dict, compressed_alpha),
    ))
}

/// Byte length of one `channels`-deep sample plane, widened before multiplying.
fn plane_len(width: u32, height: u32, channels: usize) -> usize {
    width as usize * height as usize * channels
}

fn image_dictionary(width: u32, height: u32, color_space: &[u8], length: usize) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"XObject".to_vec()));
    dict.set("Subtype", Object::Name(b"Image".to_vec()));
    dict.set("Width", Object::Integer(width as i64));
    dict.set("Height", Object::Integer(height as i64));
    dict.set("ColorSpace", Object::Name(color_space.to_vec()));
    dict.set("BitsPerComponent", Object::Integer(8));
    dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
    dict.set("Length", Object::Integer(length as i64));
    dict
}

fn flate(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| format!("Failed to compress image data: {}", e))?;
    encoder
        .finish()
        .map_err(|e| format!("Failed to finish compression: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use image::{DynamicImage, Rgba};
    use std::io::Read;

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn smask_carries_scaled_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let source = RgbaImage::from_fn(3, 2, |x, y| Rgba([x as u8, y as u8, 9, 200]));
        let asset =
            WatermarkAsset::from_image(DynamicImage::ImageRgba8(source), 0.5, Some(dir.path()))
                .unwrap();

        let mut doc = Document::with_version("1.5");
        let image_id = embed_watermark(&mut doc, &asset).unwrap();

        let image = doc.get_object(image_id).unwrap().as_stream().unwrap();
        assert_eq!(image.dict.get(b"Width").unwrap().as_i64().unwrap(), 3);
        assert_eq!(image.dict.get(b"Height").unwrap().as_i64().unwrap(), 2);
        let rgb = inflate(&image.content);
        assert_eq!(rgb.len(), 3 * 2 * 3);
        assert_eq!(&rgb[..3], &[0, 0, 9]);

        let smask_id = image.dict.get(b"SMask").unwrap().as_reference().unwrap();
        let smask = doc.get_object(smask_id).unwrap().as_stream().unwrap();
        assert_eq!(
            smask.dict.get(b"ColorSpace").unwrap().as_name().unwrap(),
            b"DeviceGray"
        );
        assert_eq!(inflate(&smask.content), vec![100; 6]);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn plane_len_does_not_wrap_at_u32() {
        assert_eq!(plane_len(70_000, 70_000, 3), 14_700_000_000);
        assert_eq!(plane_len(u32::MAX, 2, 1), 2 * u32::MAX as usize);
    }

    #[test]
    fn empty_image_is_rejected() {
        let err = encode_rgba_streams(&RgbaImage::new(0, 0)).unwrap_err();
        assert!(err.contains("no pixels"));
    }
}

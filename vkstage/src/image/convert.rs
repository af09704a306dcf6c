// Copyright (c) 2016 The vkstage developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Conversion of host image data between component layouts and encodings.
//!
//! Every texel is decoded into four `f64` channels, RGBA, and encoded again. Components the
//! source lacks decode to 0, except alpha which decodes to 1.

use crate::format::{DataType, ImageFormat};
use half::f16;

/// Host image data to be uploaded.
#[derive(Clone, Copy, Debug)]
pub struct SrcImage<'a> {
    pub format: ImageFormat,
    pub data_type: DataType,
    pub data: &'a [u8],
}

impl<'a> SrcImage<'a> {
    #[inline]
    pub fn new(format: ImageFormat, data_type: DataType, data: &'a [u8]) -> Self {
        SrcImage {
            format,
            data_type,
            data,
        }
    }

    /// Describes a slice of plain components, for example `&[f32]` or `&[[u8; 4]]`.
    #[inline]
    pub fn from_texels<T: bytemuck::Pod>(
        format: ImageFormat,
        data_type: DataType,
        texels: &'a [T],
    ) -> Self {
        SrcImage::new(format, data_type, bytemuck::cast_slice(texels))
    }

    /// Returns the number of bytes one texel occupies.
    #[inline]
    pub fn texel_size(&self) -> usize {
        self.format.component_count() * self.data_type.size()
    }
}

/// Host memory that downloaded image data is written to.
#[derive(Debug)]
pub struct DstImage<'a> {
    pub format: ImageFormat,
    pub data_type: DataType,
    pub data: &'a mut [u8],
}

impl<'a> DstImage<'a> {
    #[inline]
    pub fn new(format: ImageFormat, data_type: DataType, data: &'a mut [u8]) -> Self {
        DstImage {
            format,
            data_type,
            data,
        }
    }

    /// Describes a mutable slice of plain components.
    #[inline]
    pub fn from_texels<T: bytemuck::Pod>(
        format: ImageFormat,
        data_type: DataType,
        texels: &'a mut [T],
    ) -> Self {
        DstImage::new(format, data_type, bytemuck::cast_slice_mut(texels))
    }

    #[inline]
    pub fn texel_size(&self) -> usize {
        self.format.component_count() * self.data_type.size()
    }
}

/// Converts `texel_count` texels of `src` into `dst_format` and `dst_type`.
///
/// Returns [`None`] if `src` is already in that description and can be used as is. `src.data`
/// must hold at least `texel_count` texels.
pub fn convert_image(
    src: &SrcImage<'_>,
    dst_format: ImageFormat,
    dst_type: DataType,
    texel_count: usize,
) -> Option<Vec<u8>> {
    if src.format == dst_format && src.data_type == dst_type {
        return None;
    }

    let dst_texel_size = dst_format.component_count() * dst_type.size();
    let mut out = vec![0; texel_count * dst_texel_size];

    convert_texels(
        src.data,
        src.format,
        src.data_type,
        &mut out,
        dst_format,
        dst_type,
        texel_count,
    );

    Some(out)
}

/// Converts `texel_count` texels of native data into the description of `dst`, writing them to
/// the front of `dst.data`.
pub(crate) fn convert_into(
    src: &[u8],
    src_format: ImageFormat,
    src_type: DataType,
    dst: &mut DstImage<'_>,
    texel_count: usize,
) {
    if src_format == dst.format && src_type == dst.data_type {
        let len = src.len().min(dst.data.len());
        dst.data[..len].copy_from_slice(&src[..len]);
    } else {
        convert_texels(
            src,
            src_format,
            src_type,
            dst.data,
            dst.format,
            dst.data_type,
            texel_count,
        );
    }
}

fn convert_texels(
    src: &[u8],
    src_format: ImageFormat,
    src_type: DataType,
    dst: &mut [u8],
    dst_format: ImageFormat,
    dst_type: DataType,
    texel_count: usize,
) {
    let src_texel_size = src_format.component_count() * src_type.size();
    let dst_texel_size = dst_format.component_count() * dst_type.size();

    for (src_texel, dst_texel) in src
        .chunks_exact(src_texel_size)
        .zip(dst.chunks_exact_mut(dst_texel_size))
        .take(texel_count)
    {
        let color = decode_texel(src_texel, src_format, src_type);
        encode_texel(&color, dst_format, dst_type, dst_texel);
    }
}

/// Produces `texel_count` texels of `color`.
pub fn generate_image(
    format: ImageFormat,
    data_type: DataType,
    texel_count: usize,
    color: [f64; 4],
) -> Vec<u8> {
    let mut texel = vec![0; format.component_count() * data_type.size()];
    encode_texel(&color, format, data_type, &mut texel);

    texel.repeat(texel_count)
}

fn decode_texel(texel: &[u8], format: ImageFormat, data_type: DataType) -> [f64; 4] {
    let mut color = [0.0, 0.0, 0.0, 1.0];
    let size = data_type.size();

    for (&channel, component) in format.channels().iter().zip(texel.chunks_exact(size)) {
        color[channel] = decode_component(component, data_type);
    }

    color
}

fn encode_texel(color: &[f64; 4], format: ImageFormat, data_type: DataType, texel: &mut [u8]) {
    let size = data_type.size();

    for (&channel, component) in format.channels().iter().zip(texel.chunks_exact_mut(size)) {
        encode_component(color[channel], data_type, component);
    }
}

fn decode_component(bytes: &[u8], data_type: DataType) -> f64 {
    macro_rules! read {
        ($ty:ty) => {
            <$ty>::from_ne_bytes(bytes.try_into().unwrap_or_default())
        };
    }

    match data_type {
        DataType::Int8 => (f64::from(read!(i8)) / f64::from(i8::MAX)).max(-1.0),
        DataType::UInt8 => f64::from(read!(u8)) / f64::from(u8::MAX),
        DataType::Int16 => (f64::from(read!(i16)) / f64::from(i16::MAX)).max(-1.0),
        DataType::UInt16 => f64::from(read!(u16)) / f64::from(u16::MAX),
        DataType::Int32 => (f64::from(read!(i32)) / f64::from(i32::MAX)).max(-1.0),
        DataType::UInt32 => f64::from(read!(u32)) / f64::from(u32::MAX),
        DataType::Float16 => f16::from_bits(read!(u16)).to_f64(),
        DataType::Float32 => f64::from(read!(f32)),
        DataType::Float64 => read!(f64),
    }
}

fn encode_component(value: f64, data_type: DataType, out: &mut [u8]) {
    let unorm = |max: f64| (value.clamp(0.0, 1.0) * max).round();
    let snorm = |max: f64| (value.clamp(-1.0, 1.0) * max).round();

    match data_type {
        DataType::Int8 => out.copy_from_slice(&(snorm(i8::MAX.into()) as i8).to_ne_bytes()),
        DataType::UInt8 => out.copy_from_slice(&(unorm(u8::MAX.into()) as u8).to_ne_bytes()),
        DataType::Int16 => out.copy_from_slice(&(snorm(i16::MAX.into()) as i16).to_ne_bytes()),
        DataType::UInt16 => out.copy_from_slice(&(unorm(u16::MAX.into()) as u16).to_ne_bytes()),
        DataType::Int32 => out.copy_from_slice(&(snorm(i32::MAX.into()) as i32).to_ne_bytes()),
        DataType::UInt32 => out.copy_from_slice(&(unorm(u32::MAX.into()) as u32).to_ne_bytes()),
        DataType::Float16 => out.copy_from_slice(&f16::from_f64(value).to_bits().to_ne_bytes()),
        DataType::Float32 => out.copy_from_slice(&(value as f32).to_ne_bytes()),
        DataType::Float64 => out.copy_from_slice(&value.to_ne_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_description_is_not_converted() {
        let data = [1u8, 2, 3, 4];
        let src = SrcImage::new(ImageFormat::RGBA, DataType::UInt8, &data);

        assert!(convert_image(&src, ImageFormat::RGBA, DataType::UInt8, 1).is_none());
    }

    #[test]
    fn rgb_float_to_rgba8() {
        let texels = [[1.0f32, 0.5, 0.0], [0.0, 0.0, 2.0]];
        let src = SrcImage::from_texels(ImageFormat::RGB, DataType::Float32, &texels);

        let out = convert_image(&src, ImageFormat::RGBA, DataType::UInt8, 2).unwrap();
        // Missing alpha becomes opaque and out-of-range values clamp.
        assert_eq!(out, [255, 128, 0, 255, 0, 0, 255, 255]);
    }

    #[test]
    fn bgra_swizzle() {
        let data = [10u8, 20, 30, 40];
        let src = SrcImage::new(ImageFormat::BGRA, DataType::UInt8, &data);

        let out = convert_image(&src, ImageFormat::RGBA, DataType::UInt8, 1).unwrap();
        assert_eq!(out, [30, 20, 10, 40]);
    }

    #[test]
    fn half_floats() {
        let data = [255u8, 0];
        let src = SrcImage::new(ImageFormat::RG, DataType::UInt8, &data);

        let out = convert_image(&src, ImageFormat::RG, DataType::Float16, 1).unwrap();
        let halves: Vec<f32> = out
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_ne_bytes([c[0], c[1]])).to_f32())
            .collect();
        assert_eq!(halves, [1.0, 0.0]);
    }

    #[test]
    fn clear_color_fill() {
        let out = generate_image(ImageFormat::RGBA, DataType::UInt8, 3, [1.0, 0.0, 0.5, 1.0]);

        assert_eq!(out.len(), 12);
        assert!(out.chunks_exact(4).all(|texel| texel == [255, 0, 128, 255]));

        let depth = generate_image(ImageFormat::Depth, DataType::Float32, 2, [0.25; 4]);
        let depth: Vec<f32> = depth
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(depth, [0.25, 0.25]);
    }

    #[test]
    fn readback_conversion() {
        let native = [255u8, 0, 0, 255, 0, 255, 0, 255];
        let mut out = [0.0f32; 8];
        let mut dst = DstImage::from_texels(ImageFormat::RGBA, DataType::Float32, &mut out);

        convert_into(&native, ImageFormat::RGBA, DataType::UInt8, &mut dst, 2);
        assert_eq!(out, [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }
}

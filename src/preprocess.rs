//! 画像の前処理
//!
//! アップロードされた画像を、モデルの入力契約に合った
//! `(1, 224, 224, 3)` のテンソルへ変換します。
//!
//! 処理順序:
//! 1. デコード（形式は自動判定）
//! 2. RGBへの変換（アルファ・グレースケール・パレットを展開）
//! 3. 補正（コントラスト → 明るさ → 彩度、任意）
//! 4. 高品質フィルタで 224x224 にリサイズ
//! 5. テンソル化し、モデルが要求するスケールへ正規化

use image::{imageops::FilterType, DynamicImage, ImageReader, Rgb, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;

use crate::model::config::PreprocessSettings;

/// モデル入力の一辺のサイズ
pub const INPUT_SIZE: usize = 224;

/// モデル入力テンソルの形状 (batch, height, width, channels)
pub const INPUT_SHAPE: [usize; 4] = [1, INPUT_SIZE, INPUT_SIZE, 3];

/// 画素値のスケール
///
/// 正規化は前処理かモデルのどちらか一方でのみ行う。
/// テンソルはこのタグを持ち、推論アダプタがモデル側の期待と照合する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PixelScale {
    /// 255で割った [0, 1] の値
    #[default]
    Unit,
    /// [0, 255] のまま（モデル側で固有の前処理を行う）
    Raw,
}

impl PixelScale {
    fn multiplier(self) -> f32 {
        match self {
            PixelScale::Unit => 1.0 / 255.0,
            PixelScale::Raw => 1.0,
        }
    }
}

impl std::fmt::Display for PixelScale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelScale::Unit => write!(f, "[0, 1]"),
            PixelScale::Raw => write!(f, "[0, 255]"),
        }
    }
}

/// リサイズフィルタ（最近傍法は選べない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ResizeFilter {
    #[default]
    Lanczos3,
    CatmullRom,
    Triangle,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Triangle => FilterType::Triangle,
        }
    }
}

/// 補正係数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhanceFactors {
    pub contrast: f32,
    pub brightness: f32,
    pub color: f32,
}

impl Default for EnhanceFactors {
    fn default() -> Self {
        Self {
            contrast: 1.2,
            brightness: 1.1,
            color: 1.2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("image upload is empty")]
    Empty,
    #[error("image has zero width or height")]
    ZeroSized,
    #[error("could not read image data: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not decode image: {0}")]
    Image(#[from] image::ImageError),
}

/// 正規化済み画像テンソル (NHWC)
#[derive(Debug, Clone)]
pub struct ImageTensor {
    data: Array4<f32>,
    scale: PixelScale,
}

impl ImageTensor {
    pub fn new(data: Array4<f32>, scale: PixelScale) -> Self {
        Self { data, scale }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn scale(&self) -> PixelScale {
        self.scale
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.data
    }

    /// 標準レイアウトの要素列（NHWC順）
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}

/// 画像ノーマライザ
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    size: u32,
    enhance: Option<EnhanceFactors>,
    filter: ResizeFilter,
}

impl Default for ImageNormalizer {
    fn default() -> Self {
        Self {
            size: INPUT_SIZE as u32,
            enhance: Some(EnhanceFactors::default()),
            filter: ResizeFilter::default(),
        }
    }
}

impl ImageNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定から作成
    pub fn from_settings(settings: &PreprocessSettings) -> Self {
        Self {
            size: INPUT_SIZE as u32,
            enhance: settings.enhance.then_some(settings.enhance_factors),
            filter: settings.resize_filter,
        }
    }

    pub fn without_enhancement(mut self) -> Self {
        self.enhance = None;
        self
    }

    /// エンコード済みの画像バイト列をテンソルへ変換
    pub fn normalize(&self, bytes: &[u8], scale: PixelScale) -> Result<ImageTensor, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }

        let image = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .decode()?;

        self.normalize_image(&image, scale)
    }

    /// 画像ファイルを読み込んでテンソルへ変換
    pub fn open(&self, path: &Path, scale: PixelScale) -> Result<ImageTensor, DecodeError> {
        let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        self.normalize_image(&image, scale)
    }

    /// デコード済み画像をテンソルへ変換
    pub fn normalize_image(
        &self,
        image: &DynamicImage,
        scale: PixelScale,
    ) -> Result<ImageTensor, DecodeError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DecodeError::ZeroSized);
        }

        // 補正の前に必ずRGBへ揃える
        let mut rgb = image.to_rgb8();

        if let Some(factors) = &self.enhance {
            enhance(&mut rgb, factors);
        }

        let resized = image::imageops::resize(&rgb, self.size, self.size, self.filter.into());
        let multiplier = scale.multiplier();
        let size = self.size as usize;

        let data = Array4::<f32>::from_shape_fn((1, size, size, 3), |(_, y, x, c)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 * multiplier
        });

        Ok(ImageTensor::new(data, scale))
    }
}

/// ITU-R 601-2 の輝度
fn luminance(pixel: &Rgb<u8>) -> f32 {
    let [r, g, b] = pixel.0;
    (299.0 * r as f32 + 587.0 * g as f32 + 114.0 * b as f32) / 1000.0
}

/// 小数部は切り捨て（PILの `Image.blend` と同じ）
fn blend(degenerate: f32, value: u8, factor: f32) -> u8 {
    (degenerate + factor * (value as f32 - degenerate)).clamp(0.0, 255.0) as u8
}

/// コントラスト → 明るさ → 彩度 の順で補正
///
/// 各段は基準画像との線形補間 `基準 + 係数 * (画素 - 基準)`。
/// - コントラスト: 画像全体の平均輝度
/// - 明るさ: 黒
/// - 彩度: 画素自身の輝度（グレースケール）
pub fn enhance(image: &mut RgbImage, factors: &EnhanceFactors) {
    let pixel_count = image.width() as u64 * image.height() as u64;
    if pixel_count == 0 {
        return;
    }

    // コントラスト
    let luminance_sum: f64 = image.pixels().map(|p| luminance(p).round() as f64).sum();
    let mean = (luminance_sum / pixel_count as f64).round() as f32;
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = blend(mean, *channel, factors.contrast);
        }
    }

    // 明るさ
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = blend(0.0, *channel, factors.brightness);
        }
    }

    // 彩度
    for pixel in image.pixels_mut() {
        let gray = luminance(pixel).round();
        for channel in pixel.0.iter_mut() {
            *channel = blend(gray, *channel, factors.color);
        }
    }
}

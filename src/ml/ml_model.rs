//! 食品分類用CNNモデル
//!
//! 汎用の特徴抽出部（バックボーン）と、カタログのクラス数に合わせた
//! 分類ヘッドで構成されます。バックボーンだけの重みを別ファイルとして
//! 保持しておき、ヘッドを差し替えて転移学習・フォールバック推論に使います。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::preprocess::{PixelScale, INPUT_SIZE};

/// バックボーンの出力特徴次元
pub const BACKBONE_FEATURES: usize = 256;

/// ImageNetの平均と標準偏差
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl ModelConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> FoodClassifier<B> {
        tracing::debug!(
            "FoodClassifier: {}x{} input, {} features -> {} classes, dropout={}",
            INPUT_SIZE,
            INPUT_SIZE,
            BACKBONE_FEATURES,
            self.num_classes,
            self.dropout
        );

        FoodClassifier {
            backbone: Backbone::new(device),
            head: Head {
                dropout: DropoutConfig::new(self.dropout).init(),
                linear: LinearConfig::new(BACKBONE_FEATURES, self.num_classes).init(device),
            },
        }
    }
}

/// 特徴抽出部
///
/// {Conv 3x3 (padding 1) + ReLU + MaxPool 2x2} x 4段
/// （32 → 64 → 128 → 256 チャネル）の後、全体平均プーリングで 1x1 にする。
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    pool: MaxPool2d,
    global_pool: AdaptiveAvgPool2d,
    activation: Relu,
}

impl<B: Backend> Backbone<B> {
    pub fn new(device: &B::Device) -> Self {
        let conv = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Self {
            conv1: conv([3, 32]),
            conv2: conv([32, 64]),
            conv3: conv([64, 128]),
            conv4: conv([128, BACKBONE_FEATURES]),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: Relu::new(),
        }
    }

    /// [batch, 3, H, W] -> [batch, BACKBONE_FEATURES]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let mut x = images;
        for conv in [&self.conv1, &self.conv2, &self.conv3, &self.conv4] {
            x = conv.forward(x);
            x = self.activation.forward(x);
            x = self.pool.forward(x);
        }

        self.global_pool
            .forward(x)
            .reshape([batch_size, BACKBONE_FEATURES])
    }
}

/// 分類ヘッド
#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    dropout: Dropout,
    linear: Linear<B>,
}

impl<B: Backend> Head<B> {
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(self.dropout.forward(features))
    }
}

/// 食品分類モデル
#[derive(Module, Debug)]
pub struct FoodClassifier<B: Backend> {
    backbone: Backbone<B>,
    head: Head<B>,
}

impl<B: Backend> FoodClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: 正規化済みのバッチ画像 [batch_size, 3, 224, 224]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// クラスごとの確率（softmax）
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn num_classes(&self) -> usize {
        let [_, num_classes] = self.head.linear.weight.val().dims();
        num_classes
    }

    /// 学習済みバックボーンの重みを読み込む（ヘッドは初期値のまま）
    pub fn load_backbone_record(mut self, record: BackboneRecord<B>) -> Self {
        self.backbone = self.backbone.load_record(record);
        self
    }

    /// バックボーンの勾配計算を止める（ヘッドのみ学習）
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.no_grad();
        self
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// NHWC順の画素列をモデル入力 [batch, 3, H, W] に変換し、スケールに応じて正規化
///
/// - `Unit` ([0, 1]): ImageNetの平均・標準偏差で標準化
/// - `Raw` ([0, 255]): `x / 127.5 - 1` で [-1, 1] に写像
pub fn to_model_input<B: Backend>(
    pixels: &[f32],
    batch_size: usize,
    scale: PixelScale,
    device: &B::Device,
) -> Tensor<B, 4> {
    let images = Tensor::<B, 1>::from_floats(pixels, device)
        .reshape([batch_size, INPUT_SIZE, INPUT_SIZE, 3])
        .permute([0, 3, 1, 2]);

    match scale {
        PixelScale::Unit => {
            let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, device).reshape([1, 3, 1, 1]);
            let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, device).reshape([1, 3, 1, 1]);
            (images - mean) / std
        }
        PixelScale::Raw => images / 127.5 - 1.0,
    }
}

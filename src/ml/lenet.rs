//! LeNet-5 型 CNN の定義
//!
//! 32x32 のグレースケール交通標識画像を 43 クラスに分類します。

use anyhow::bail;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AvgPool2d, AvgPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use log::debug;

/// クラス数
pub const NUM_CLASSES: usize = 43;

/// 画像サイズ
pub const IMAGE_SIZE: usize = 32;

/// 畳み込みカーネルサイズ
const KERNEL_SIZE: usize = 5;
const CONV1_FILTERS: usize = 6;
const CONV2_FILTERS: usize = 16;
const FC1_UNITS: usize = 120;
const FC2_UNITS: usize = 84;

/// クラス名の定義（GTSRB）
pub const SIGN_NAMES: [&str; NUM_CLASSES] = [
    "Speed limit (20km/h)",
    "Speed limit (30km/h)",
    "Speed limit (50km/h)",
    "Speed limit (60km/h)",
    "Speed limit (70km/h)",
    "Speed limit (80km/h)",
    "End of speed limit (80km/h)",
    "Speed limit (100km/h)",
    "Speed limit (120km/h)",
    "No passing",
    "No passing for vehicles over 3.5 metric tons",
    "Right-of-way at the next intersection",
    "Priority road",
    "Yield",
    "Stop",
    "No vehicles",
    "Vehicles over 3.5 metric tons prohibited",
    "No entry",
    "General caution",
    "Dangerous curve to the left",
    "Dangerous curve to the right",
    "Double curve",
    "Bumpy road",
    "Slippery road",
    "Road narrows on the right",
    "Road work",
    "Traffic signals",
    "Pedestrians",
    "Children crossing",
    "Bicycles crossing",
    "Beware of ice/snow",
    "Wild animals crossing",
    "End of all speed and passing limits",
    "Turn right ahead",
    "Turn left ahead",
    "Ahead only",
    "Go straight or right",
    "Go straight or left",
    "Keep right",
    "Keep left",
    "Roundabout mandatory",
    "End of no passing",
    "End of no passing by vehicles over 3.5 metric tons",
];

/// クラスIDから標識名を取得
pub fn sign_name(class_id: usize) -> &'static str {
    SIGN_NAMES.get(class_id).copied().unwrap_or("unknown")
}

/// モデル設定
#[derive(Config, Debug)]
pub struct LeNetConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 32)]
    pub image_size: usize,
}

impl LeNetConfig {
    /// 2 段目のプーリング後の特徴マップサイズ
    ///
    /// Conv (5x5, no padding): size -> size - 4
    /// AvgPool (2x2, stride 2): size -> size / 2 (切り捨て)
    pub fn feature_map_size(&self) -> Option<usize> {
        let after_conv1 = self.image_size.checked_sub(KERNEL_SIZE - 1).filter(|&s| s > 0)?;
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.checked_sub(KERNEL_SIZE - 1).filter(|&s| s > 0)?;
        let after_pool2 = after_conv2 / 2;
        (after_pool2 > 0).then_some(after_pool2)
    }

    /// Flatten 後の特徴次元（32x32 入力で 400）
    pub fn flattened_features(&self) -> Option<usize> {
        self.feature_map_size().map(|size| CONV2_FILTERS * size * size)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> anyhow::Result<LeNet<B>> {
        let Some(features) = self.flattened_features() else {
            bail!("入力サイズが小さすぎます: {} (最小16x16が必要)", self.image_size);
        };
        if self.num_classes == 0 {
            bail!("クラス数は 1 以上である必要があります");
        }

        debug!("[Model] 入力サイズ: {}x{}x1", self.image_size, self.image_size);
        debug!("[Model] Flatten後の特徴次元: {}", features);
        debug!(
            "[Model] FC: {} -> {} -> {} -> {}",
            features, FC1_UNITS, FC2_UNITS, self.num_classes
        );

        Ok(LeNet {
            conv1: Conv2dConfig::new([1, CONV1_FILTERS], [KERNEL_SIZE, KERNEL_SIZE]).init(device),
            pool1: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([CONV1_FILTERS, CONV2_FILTERS], [KERNEL_SIZE, KERNEL_SIZE])
                .init(device),
            pool2: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(features, FC1_UNITS).init(device),
            fc2: LinearConfig::new(FC1_UNITS, FC2_UNITS).init(device),
            fc3: LinearConfig::new(FC2_UNITS, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 交通標識分類用 LeNet
///
/// # アーキテクチャ
/// - Conv 5x5 x6 + ReLU -> AvgPool 2x2
/// - Conv 5x5 x16 + ReLU -> AvgPool 2x2
/// - Flatten
/// - FC 120 + ReLU -> FC 84 + ReLU -> FC num_classes
/// - Softmax (予測時)
#[derive(Module, Debug)]
pub struct LeNet<B: Backend> {
    conv1: Conv2d<B>,
    pool1: AvgPool2d,
    conv2: Conv2d<B>,
    pool2: AvgPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
    activation: Relu,
}

impl<B: Backend> LeNet<B> {
    /// 順伝播
    ///
    /// - `images`: [batch_size, 1, size, size]
    /// - 戻り値: クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.fc2.forward(x);
        let x = self.activation.forward(x);

        self.fc3.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算
    ///
    /// 損失はロジットに対する交差エントロピー（sparse categorical crossentropy 相当）
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

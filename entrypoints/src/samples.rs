use anyhow::Result;
use clap::ValueEnum;
use flexpar_core::params::{ActiMode, PoolType};
use flexpar_core::{DataType, FFConfig, FFModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SampleModel {
    Mlp,
    Cnn,
    Transformer,
}

impl SampleModel {
    pub fn build(self, config: FFConfig) -> Result<FFModel> {
        let batch = config.batch_size();
        let mut model = FFModel::new(config);
        match self {
            SampleModel::Mlp => mlp(&mut model, batch)?,
            SampleModel::Cnn => cnn(&mut model, batch)?,
            SampleModel::Transformer => transformer(&mut model, batch)?,
        }
        tracing::info!("{} with {} layers", self, model.layers().len());
        Ok(model)
    }
}

fn mlp(model: &mut FFModel, batch: usize) -> Result<()> {
    let x = model.input(&[batch, 784], DataType::Float)?;
    let h = model.dense(x, 512, ActiMode::Relu, true, Some("fc1"))?;
    let h = model.dense(h, 512, ActiMode::Relu, true, Some("fc2"))?;
    let y = model.dense(h, 10, ActiMode::None, true, Some("fc3"))?;
    model.softmax(y, 1, Some("softmax"))?;
    Ok(())
}

fn cnn(model: &mut FFModel, batch: usize) -> Result<()> {
    let x = model.input(&[batch, 3, 32, 32], DataType::Float)?;
    let t = model.conv2d(x, 32, (3, 3), (1, 1), (1, 1), ActiMode::Relu, 1, true, Some("conv1"))?;
    let t = model.pool2d(t, (2, 2), (2, 2), (0, 0), PoolType::Max, Some("pool1"))?;
    let t = model.conv2d(t, 64, (3, 3), (1, 1), (1, 1), ActiMode::None, 1, true, Some("conv2"))?;
    let t = model.batch_norm(t, true, Some("bn2"))?;
    let t = model.pool2d(t, (2, 2), (2, 2), (0, 0), PoolType::Avg, Some("pool2"))?;
    let t = model.flat(t, Some("flat"))?;
    let t = model.dense(t, 256, ActiMode::Relu, true, Some("fc1"))?;
    let t = model.dropout(t, 0.5, 0, Some("dropout"))?;
    let y = model.dense(t, 10, ActiMode::None, true, Some("fc2"))?;
    model.softmax(y, 1, Some("softmax"))?;
    Ok(())
}

fn transformer(model: &mut FFModel, batch: usize) -> Result<()> {
    let (seq, hidden, heads) = (16, 64, 4);
    let x = model.input(&[batch, seq, hidden], DataType::Float)?;
    let mut t = x;
    for layer in 0..2 {
        let name = |part: &str| format!("layer{}_{}", layer, part);
        let attn = model.multihead_attention(t, t, t, hidden, heads, 0.1, true, Some(&name("attn")))?;
        let res = model.add(attn, t)?;
        let norm = model.layer_norm(res, &[2], false, 1e-5, Some(&name("norm1")))?;
        let ff = model.dense(norm, 4 * hidden, ActiMode::Gelu, true, Some(&name("ff1")))?;
        let ff = model.dense(ff, hidden, ActiMode::None, true, Some(&name("ff2")))?;
        let res = model.add(ff, norm)?;
        t = model.layer_norm(res, &[2], false, 1e-5, Some(&name("norm2")))?;
    }
    let t = model.reshape(t, &[batch, seq * hidden], Some("collapse"))?;
    let y = model.dense(t, 10, ActiMode::None, true, Some("classifier"))?;
    model.softmax(y, 1, Some("softmax"))?;
    Ok(())
}

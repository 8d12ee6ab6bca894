use super::*;

use crate::tensor::Tensor;
use std::io::Cursor;
use tract_onnx::prelude::{
    DatumExt, Framework, InferenceModel, InferenceModelExt, OutletId, TVec, TValue,
    Tensor as TractTensor, TypedModel, TypedRunnableModel,
};

/// CPU backend on top of tract-onnx.
///
/// Input facts are pinned to `[1, 3, size, size]` for the image and
/// `[1, 1, size, size]` for the mask so the graph can be fully optimised.
#[derive(Debug, Clone)]
pub struct TractBackend {
    image_size: usize,
}

impl TractBackend {
    pub fn new(image_size: u32) -> Self {
        TractBackend {
            image_size: image_size as usize,
        }
    }
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn create_session(
        &self,
        model: &[u8],
        target: ExecutionTarget,
    ) -> InferenceResult<Arc<dyn InferenceSession>> {
        if target != ExecutionTarget::Cpu {
            return Err(InferenceError::UnsupportedExecutionTarget(target));
        }

        let mut graph = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(model))
            .map_err(|e| InferenceError::FailedToBuildModelFromBuffer(e.to_string()))?;

        let inputs = outlet_names(&graph, graph.input_outlets()?);
        let outputs = outlet_names(&graph, graph.output_outlets()?);

        for (index, name) in inputs.iter().enumerate() {
            let channels = if name == MASK_INPUT { 1 } else { 3 };
            let shape = [1, channels, self.image_size, self.image_size];
            graph.set_input_fact(index, f32::fact(shape).into())?;
        }

        let plan = graph.into_optimized()?.into_runnable()?;

        log::info!(
            "tract session ready - inputs {:?}, outputs {:?}",
            &inputs,
            &outputs
        );

        Ok(Arc::new(TractSession {
            plan,
            target,
            inputs,
            outputs,
        }))
    }
}

/// Graph-level names of `outlets`: the ONNX value name when the loader
/// labelled the outlet, the producing node's name otherwise.
fn outlet_names(graph: &InferenceModel, outlets: &[OutletId]) -> Vec<String> {
    outlets
        .iter()
        .map(|outlet| match graph.outlet_label(*outlet) {
            Some(label) => label.to_string(),
            None => graph.node(outlet.node).name.clone(),
        })
        .collect()
}

pub struct TractSession {
    plan: TypedRunnableModel<TypedModel>,
    target: ExecutionTarget,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl InferenceSession for TractSession {
    fn target(&self) -> ExecutionTarget {
        self.target
    }

    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn infer(&self, mut inputs: NamedTensors) -> InferenceResult<NamedTensors> {
        let mut values: TVec<TValue> = TVec::new();

        for name in &self.inputs {
            let tensor = inputs
                .remove(name)
                .ok_or_else(|| InferenceError::MissingInput(name.clone()))?;
            let (shape, data) = tensor.into_parts();
            values.push(TractTensor::from_shape(&shape, &data)?.into());
        }

        let results = self.plan.run(values)?;

        let mut outputs = NamedTensors::with_capacity(results.len());
        for (name, value) in self.outputs.iter().zip(results.iter()) {
            let view = value.to_array_view::<f32>()?;
            let tensor = Tensor::new(view.shape().to_vec(), view.iter().copied().collect())?;
            outputs.insert(name.clone(), tensor);
        }

        if outputs.is_empty() {
            log::error!("infer() - model produced no outputs");
            return Err(InferenceError::RuntimeError("model produced no outputs".into()));
        }

        Ok(outputs)
    }
}

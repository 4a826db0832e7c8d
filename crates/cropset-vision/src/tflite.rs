use anyhow::{Context, Result};
use image::DynamicImage;
use std::path::Path;
use std::{ffi::CString, os::raw::{c_char, c_int, c_void}, ptr};
use tracing::{debug, info};

use cropset_core::{Detector, RawDetections};

use crate::{rgb_input, ssd_outputs};

#[repr(C)]
struct TfLiteModel;
#[repr(C)]
struct TfLiteInterpreterOptions;
#[repr(C)]
struct TfLiteInterpreter;
#[repr(C)]
struct TfLiteTensor;

// TfLiteType values from the C API
const TFLITE_FLOAT32: c_int = 1;
const TFLITE_UINT8: c_int = 3;

#[link(name = "tensorflowlite_c")]
extern "C" {
    fn TfLiteModelCreateFromFile(model_path: *const c_char) -> *mut TfLiteModel;
    fn TfLiteModelDelete(model: *mut TfLiteModel);

    fn TfLiteInterpreterOptionsCreate() -> *mut TfLiteInterpreterOptions;
    fn TfLiteInterpreterOptionsDelete(options: *mut TfLiteInterpreterOptions);
    fn TfLiteInterpreterOptionsSetNumThreads(options: *mut TfLiteInterpreterOptions, num_threads: c_int);

    fn TfLiteInterpreterCreate(model: *const TfLiteModel, options: *const TfLiteInterpreterOptions) -> *mut TfLiteInterpreter;
    fn TfLiteInterpreterDelete(interpreter: *mut TfLiteInterpreter);

    fn TfLiteInterpreterAllocateTensors(interpreter: *mut TfLiteInterpreter) -> c_int;
    fn TfLiteInterpreterInvoke(interpreter: *mut TfLiteInterpreter) -> c_int;

    fn TfLiteInterpreterGetOutputTensorCount(interpreter: *const TfLiteInterpreter) -> c_int;
    fn TfLiteInterpreterGetInputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *mut TfLiteTensor;
    fn TfLiteInterpreterGetOutputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *const TfLiteTensor;

    fn TfLiteTensorType(tensor: *const TfLiteTensor) -> c_int;
    fn TfLiteTensorData(tensor: *const TfLiteTensor) -> *mut c_void;
    fn TfLiteTensorByteSize(tensor: *const TfLiteTensor) -> usize;

    fn TfLiteTensorNumDims(tensor: *const TfLiteTensor) -> c_int;
    fn TfLiteTensorDim(tensor: *const TfLiteTensor, dim_index: c_int) -> c_int;
}

/// SSD detector exported with the TFLite detection postprocess op.
///
/// Expects one `[1, h, w, 3]` input (uint8 or float32 in 0..1) and four
/// outputs in the usual order: boxes `[1, n, 4]` as normalized
/// `[top, left, bottom, right]`, classes `[1, n]`, scores `[1, n]`, count `[1]`.
pub struct TfliteDetector {
    model: *mut TfLiteModel,
    opts: *mut TfLiteInterpreterOptions,
    interp: *mut TfLiteInterpreter,
    input_w: u32,
    input_h: u32,
    input_type: c_int,
}

// The interpreter is only ever driven through `&mut self`.
unsafe impl Send for TfliteDetector {}

impl TfliteDetector {
    pub fn new(model_path: &Path, num_threads: i32) -> Result<Self> {
        let path_str = model_path.to_str().context("model path is not valid UTF-8")?;
        let cpath = CString::new(path_str)?;
        let model = unsafe { TfLiteModelCreateFromFile(cpath.as_ptr()) };
        anyhow::ensure!(!model.is_null(), "failed to load tflite model: {}", model_path.display());

        let opts = unsafe { TfLiteInterpreterOptionsCreate() };
        if opts.is_null() {
            unsafe { TfLiteModelDelete(model) };
            anyhow::bail!("failed to create tflite options");
        }
        unsafe { TfLiteInterpreterOptionsSetNumThreads(opts, num_threads.max(1)) };

        let interp = unsafe { TfLiteInterpreterCreate(model, opts) };
        // from here on Drop releases whatever was created
        let mut det = Self { model, opts, interp, input_w: 0, input_h: 0, input_type: 0 };
        anyhow::ensure!(!interp.is_null(), "failed to create tflite interpreter");

        let rc = unsafe { TfLiteInterpreterAllocateTensors(interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterAllocateTensors failed");

        let outputs = unsafe { TfLiteInterpreterGetOutputTensorCount(interp) };
        anyhow::ensure!(
            outputs >= 4,
            "expected 4 postprocess outputs (boxes, classes, scores, count), model has {outputs}"
        );

        let input = unsafe { TfLiteInterpreterGetInputTensor(interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let (h, w) = match tensor_dims(input).as_slice() {
            [1, h, w, 3] => (*h as u32, *w as u32),
            other => anyhow::bail!("unexpected input dims {:?}, want [1, h, w, 3]", other),
        };
        let input_type = unsafe { TfLiteTensorType(input) };
        anyhow::ensure!(
            input_type == TFLITE_UINT8 || input_type == TFLITE_FLOAT32,
            "unsupported input tensor type {input_type}"
        );
        det.input_w = w;
        det.input_h = h;
        det.input_type = input_type;

        info!("detector: loaded TFLite model {} (input {w}x{h})", model_path.display());
        Ok(det)
    }

    /// Human-readable tensor layout, for checking an unfamiliar export.
    pub fn inspect(&mut self) -> Result<String> {
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let mut s = format!(
            "TFLite inspect:\n- input[0] dims={:?} type={} bytes={}\n",
            tensor_dims(input),
            unsafe { TfLiteTensorType(input) },
            unsafe { TfLiteTensorByteSize(input) }
        );
        let outputs = unsafe { TfLiteInterpreterGetOutputTensorCount(self.interp) };
        for i in 0..outputs {
            let out = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, i) };
            anyhow::ensure!(!out.is_null(), "no output tensor {i}");
            s.push_str(&format!(
                "- output[{i}] dims={:?} bytes={}\n",
                tensor_dims(out),
                unsafe { TfLiteTensorByteSize(out) }
            ));
        }
        Ok(s)
    }

    fn fill_input(&mut self, img: &DynamicImage) -> Result<()> {
        let rgb = rgb_input(img, self.input_w, self.input_h);
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let in_bytes = unsafe { TfLiteTensorByteSize(input) };
        let in_ptr = unsafe { TfLiteTensorData(input) };
        anyhow::ensure!(!in_ptr.is_null(), "null input tensor data");

        if self.input_type == TFLITE_UINT8 {
            anyhow::ensure!(in_bytes >= rgb.len(), "input tensor too small: {} < {}", in_bytes, rgb.len());
            unsafe { ptr::copy_nonoverlapping(rgb.as_ptr(), in_ptr as *mut u8, rgb.len()) };
        } else {
            let need = rgb.len() * std::mem::size_of::<f32>();
            anyhow::ensure!(in_bytes >= need, "input tensor too small: {} < {}", in_bytes, need);
            let dst = unsafe { std::slice::from_raw_parts_mut(in_ptr as *mut f32, rgb.len()) };
            for (d, &v) in dst.iter_mut().zip(&rgb) {
                *d = f32::from(v) / 255.0;
            }
        }
        Ok(())
    }

    fn output_f32(&self, index: c_int) -> Result<&[f32]> {
        let out = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, index) };
        anyhow::ensure!(!out.is_null(), "no output tensor {index}");
        anyhow::ensure!(unsafe { TfLiteTensorType(out) } == TFLITE_FLOAT32, "output {index} is not float32");
        let out_ptr = unsafe { TfLiteTensorData(out) as *const f32 };
        anyhow::ensure!(!out_ptr.is_null(), "null output tensor data {index}");
        let len = unsafe { TfLiteTensorByteSize(out) } / std::mem::size_of::<f32>();
        Ok(unsafe { std::slice::from_raw_parts(out_ptr, len) })
    }
}

impl Detector for TfliteDetector {
    fn detect(&mut self, image: &DynamicImage) -> Result<RawDetections> {
        self.fill_input(image)?;
        let rc = unsafe { TfLiteInterpreterInvoke(self.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterInvoke failed");

        let count = *self.output_f32(3)?.first().context("empty count tensor")?;
        let raw = ssd_outputs(self.output_f32(0)?, self.output_f32(1)?, self.output_f32(2)?, count)?;
        debug!("detector: {} candidate boxes, count {count}", raw.boxes.len());
        Ok(raw)
    }
}

fn tensor_dims(t: *const TfLiteTensor) -> Vec<i32> {
    unsafe {
        let nd = TfLiteTensorNumDims(t);
        let mut v = Vec::with_capacity(nd.max(0) as usize);
        for i in 0..nd { v.push(TfLiteTensorDim(t, i)); }
        v
    }
}

impl Drop for TfliteDetector {
    fn drop(&mut self) {
        unsafe {
            if !self.interp.is_null() { TfLiteInterpreterDelete(self.interp); }
            if !self.opts.is_null() { TfLiteInterpreterOptionsDelete(self.opts); }
            if !self.model.is_null() { TfLiteModelDelete(self.model); }
        }
    }
}

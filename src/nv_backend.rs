//! NVENC implementation of [`EncodeBackend`].
//!
//! One encode session per backend, bound to a caller-supplied CUDA context.
//! The input is a single CUDA allocation registered with NVENC once at open
//! (`nvEncRegisterResource(CUDADEVICEPTR)`); each submit maps it, encodes,
//! unmaps, and locks completed output in submission order. The safe layer of
//! `nvidia-video-codec-sdk` does not cover external device-pointer
//! registration, so this module drives the `sys::nvEncodeAPI` function list
//! directly.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaSlice, DevicePtr};
use nvidia_video_codec_sdk::sys::nvEncodeAPI::{
    GUID, NV_ENC_BUFFER_FORMAT, NV_ENC_CODEC_H264_GUID, NV_ENC_CODEC_HEVC_GUID, NV_ENC_CONFIG_VER,
    NV_ENC_CREATE_BITSTREAM_BUFFER, NV_ENC_CREATE_BITSTREAM_BUFFER_VER, NV_ENC_DEVICE_TYPE,
    NV_ENC_INITIALIZE_PARAMS, NV_ENC_INITIALIZE_PARAMS_VER, NV_ENC_INPUT_RESOURCE_TYPE,
    NV_ENC_LOCK_BITSTREAM, NV_ENC_LOCK_BITSTREAM_VER, NV_ENC_MAP_INPUT_RESOURCE,
    NV_ENC_MAP_INPUT_RESOURCE_VER, NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS,
    NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER, NV_ENC_PIC_FLAGS, NV_ENC_PIC_PARAMS,
    NV_ENC_PIC_PARAMS_VER, NV_ENC_PIC_STRUCT, NV_ENC_PIC_TYPE, NV_ENC_PRESET_CONFIG,
    NV_ENC_PRESET_CONFIG_VER, NV_ENC_PRESET_P4_GUID, NV_ENC_REGISTER_RESOURCE,
    NV_ENC_REGISTER_RESOURCE_VER, NV_ENC_TUNING_INFO, NV_ENCODE_API_FUNCTION_LIST,
    NV_ENCODE_API_FUNCTION_LIST_VER, NVENCAPI_VERSION, NVENCSTATUS, NvEncodeAPICreateInstance,
};
use tracing::{debug, info, warn};

use crate::contract::{
    BackendError, Codec, Dimensions, EncodeBackend, EncodedPayload, EncoderConfig, FrameFlag,
    InputSurface,
};

const OUTPUT_POOL: usize = 4;

pub struct NvEncodeBackend {
    fns: NV_ENCODE_API_FUNCTION_LIST,
    encoder: *mut c_void,
    registration: *mut c_void,
    // Every bitstream buffer ever created, for teardown.
    outputs: Vec<*mut c_void>,
    free_outputs: Vec<*mut c_void>,
    pending_outputs: VecDeque<*mut c_void>,
    // Reusable parameter scratch, zeroed before every hardware call.
    pic_params: NV_ENC_PIC_PARAMS,
    surface: InputSurface,
    dims: Dimensions,
    // Freed after the NVENC handles; `Drop::drop` runs before field drops,
    // so the unregister happens while the allocation is still alive.
    input: CudaSlice<u8>,
    ctx: Arc<CudaContext>,
}

// SAFETY: the NVENC API permits driving a single session from any thread as
// long as calls are serialized, which `&mut self` enforces. The CUDA context
// is rebound to the calling thread before every hardware call.
unsafe impl Send for NvEncodeBackend {}

impl NvEncodeBackend {
    /// Open an NVENC session for `config` on the caller's CUDA context and
    /// register the session's input buffer.
    pub fn open(config: &EncoderConfig, ctx: Arc<CudaContext>) -> Result<Self, BackendError> {
        ctx.bind_to_thread().map_err(map_cuda_error)?;
        let stream = ctx.default_stream();

        let width = config.dims.width.get();
        let height = config.dims.height.get();
        let pitch = width * 4;
        let size_bytes = (width as usize) * (height as usize) * 4;
        let input = stream
            .alloc_zeros::<u8>(size_bytes)
            .map_err(map_cuda_error)?;
        let device_ptr = {
            let (dptr, _sync) = input.device_ptr(&stream);
            dptr
        };

        let mut fns: NV_ENCODE_API_FUNCTION_LIST = unsafe { std::mem::zeroed() };
        fns.version = NV_ENCODE_API_FUNCTION_LIST_VER;
        // SAFETY: fns is zeroed with its version set; the call fills the
        // function pointers.
        check(
            unsafe { NvEncodeAPICreateInstance(&mut fns) },
            "NvEncodeAPICreateInstance",
        )?;

        let open_fn = api(fns.nvEncOpenEncodeSessionEx, "nvEncOpenEncodeSessionEx")?;
        let mut open_params: NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS = unsafe { std::mem::zeroed() };
        open_params.version = NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER;
        open_params.deviceType = NV_ENC_DEVICE_TYPE::NV_ENC_DEVICE_TYPE_CUDA;
        open_params.device = ctx.cu_ctx() as *mut c_void;
        open_params.apiVersion = NVENCAPI_VERSION;
        let mut encoder: *mut c_void = ptr::null_mut();
        // SAFETY: open_params is fully initialized and the context is bound.
        check(
            unsafe { open_fn(&mut open_params, &mut encoder) },
            "nvEncOpenEncodeSessionEx",
        )?;

        // From here the session handle is owned by the value, so every
        // early-return failure path below releases it through Drop.
        let mut backend = Self {
            fns,
            encoder,
            registration: ptr::null_mut(),
            outputs: Vec::new(),
            free_outputs: Vec::with_capacity(OUTPUT_POOL),
            pending_outputs: VecDeque::new(),
            pic_params: unsafe { std::mem::zeroed() },
            surface: InputSurface {
                device_ptr,
                pitch,
                size_bytes,
            },
            dims: config.dims,
            input,
            ctx,
        };

        backend.verify_codec_support(config.codec)?;
        backend.initialize(config)?;
        backend.register_input()?;
        for _ in 0..OUTPUT_POOL {
            let output = backend.create_output_buffer()?;
            backend.free_outputs.push(output);
        }

        info!(
            dims = %config.dims,
            fps = %config.fps,
            codec = %config.codec,
            "NVENC session opened"
        );
        Ok(backend)
    }

    fn verify_codec_support(&self, codec: Codec) -> Result<(), BackendError> {
        let count_fn = api(self.fns.nvEncGetEncodeGUIDCount, "nvEncGetEncodeGUIDCount")?;
        let mut count = 0u32;
        // SAFETY: encoder is a live session handle.
        check(
            unsafe { count_fn(self.encoder, &mut count) },
            "nvEncGetEncodeGUIDCount",
        )?;

        let list_fn = api(self.fns.nvEncGetEncodeGUIDs, "nvEncGetEncodeGUIDs")?;
        let mut guids: Vec<GUID> = vec![unsafe { std::mem::zeroed() }; count as usize];
        let mut returned = 0u32;
        // SAFETY: guids has capacity for `count` entries.
        check(
            unsafe { list_fn(self.encoder, guids.as_mut_ptr(), count, &mut returned) },
            "nvEncGetEncodeGUIDs",
        )?;
        guids.truncate(returned as usize);

        if guids.contains(&encode_guid(codec)) {
            Ok(())
        } else {
            Err(BackendError::UnsupportedCodec(codec))
        }
    }

    fn initialize(&mut self, config: &EncoderConfig) -> Result<(), BackendError> {
        let preset_fn = api(
            self.fns.nvEncGetEncodePresetConfigEx,
            "nvEncGetEncodePresetConfigEx",
        )?;
        let mut preset: NV_ENC_PRESET_CONFIG = unsafe { std::mem::zeroed() };
        preset.version = NV_ENC_PRESET_CONFIG_VER;
        preset.presetCfg.version = NV_ENC_CONFIG_VER;
        // SAFETY: preset is zeroed with both struct versions set.
        check(
            unsafe {
                preset_fn(
                    self.encoder,
                    encode_guid(config.codec),
                    NV_ENC_PRESET_P4_GUID,
                    NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_LOW_LATENCY,
                    &mut preset,
                )
            },
            "nvEncGetEncodePresetConfigEx",
        )?;

        let mut enc_config = preset.presetCfg;
        // No B-frames: the registered input must be reusable as soon as the
        // encode call returns.
        enc_config.frameIntervalP = 1;

        let width = self.dims.width.get();
        let height = self.dims.height.get();
        let mut init_params: NV_ENC_INITIALIZE_PARAMS = unsafe { std::mem::zeroed() };
        init_params.version = NV_ENC_INITIALIZE_PARAMS_VER;
        init_params.encodeGUID = encode_guid(config.codec);
        init_params.presetGUID = NV_ENC_PRESET_P4_GUID;
        init_params.tuningInfo = NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_LOW_LATENCY;
        init_params.encodeWidth = width;
        init_params.encodeHeight = height;
        init_params.darWidth = width;
        init_params.darHeight = height;
        init_params.frameRateNum = config.fps.num;
        init_params.frameRateDen = config.fps.den;
        init_params.enablePTD = 1;
        init_params.maxEncodeWidth = width;
        init_params.maxEncodeHeight = height;
        init_params.encodeConfig = &mut enc_config;

        let init_fn = api(self.fns.nvEncInitializeEncoder, "nvEncInitializeEncoder")?;
        // SAFETY: init_params is fully initialized; enc_config outlives the
        // call.
        check(
            unsafe { init_fn(self.encoder, &mut init_params) },
            "nvEncInitializeEncoder",
        )
    }

    fn register_input(&mut self) -> Result<(), BackendError> {
        let reg_fn = api(self.fns.nvEncRegisterResource, "nvEncRegisterResource")?;
        let mut reg: NV_ENC_REGISTER_RESOURCE = unsafe { std::mem::zeroed() };
        reg.version = NV_ENC_REGISTER_RESOURCE_VER;
        reg.resourceType = NV_ENC_INPUT_RESOURCE_TYPE::NV_ENC_INPUT_RESOURCE_TYPE_CUDADEVICEPTR;
        reg.width = self.dims.width.get();
        reg.height = self.dims.height.get();
        reg.pitch = self.surface.pitch;
        reg.resourceToRegister = self.surface.device_ptr as *mut c_void;
        reg.bufferFormat = NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_ARGB;
        // SAFETY: the device pointer is a live allocation owned by this
        // value; NVENC validates it.
        check(
            unsafe { reg_fn(self.encoder, &mut reg) },
            "nvEncRegisterResource",
        )?;
        self.registration = reg.registeredResource;
        debug!(device_ptr = self.surface.device_ptr, "input buffer registered");
        Ok(())
    }

    fn create_output_buffer(&mut self) -> Result<*mut c_void, BackendError> {
        let create_fn = api(
            self.fns.nvEncCreateBitstreamBuffer,
            "nvEncCreateBitstreamBuffer",
        )?;
        let mut params: NV_ENC_CREATE_BITSTREAM_BUFFER = unsafe { std::mem::zeroed() };
        params.version = NV_ENC_CREATE_BITSTREAM_BUFFER_VER;
        // SAFETY: params is zeroed with its version set; NVENC allocates the
        // buffer.
        check(
            unsafe { create_fn(self.encoder, &mut params) },
            "nvEncCreateBitstreamBuffer",
        )?;
        self.outputs.push(params.bitstreamBuffer);
        Ok(params.bitstreamBuffer)
    }

    fn take_output(&mut self) -> Result<*mut c_void, BackendError> {
        if let Some(output) = self.free_outputs.pop() {
            return Ok(output);
        }
        self.create_output_buffer()
    }

    fn unmap_input(&mut self, mapped: *mut c_void) {
        let Ok(unmap_fn) = api(self.fns.nvEncUnmapInputResource, "nvEncUnmapInputResource") else {
            return;
        };
        // SAFETY: mapped came from nvEncMapInputResource this call.
        let status = unsafe { unmap_fn(self.encoder, mapped) };
        if status != NVENCSTATUS::NV_ENC_SUCCESS {
            warn!(status = ?status, "nvEncUnmapInputResource failed");
        }
    }

    fn collect_pending(&mut self) -> Result<Vec<EncodedPayload>, BackendError> {
        let lock_fn = api(self.fns.nvEncLockBitstream, "nvEncLockBitstream")?;
        let unlock_fn = api(self.fns.nvEncUnlockBitstream, "nvEncUnlockBitstream")?;

        let mut payloads = Vec::with_capacity(self.pending_outputs.len());
        while let Some(output) = self.pending_outputs.pop_front() {
            let mut lock_params: NV_ENC_LOCK_BITSTREAM = unsafe { std::mem::zeroed() };
            lock_params.version = NV_ENC_LOCK_BITSTREAM_VER;
            lock_params.outputBitstream = output;
            // SAFETY: output came from nvEncCreateBitstreamBuffer and has a
            // completed encode queued against it; the lock blocks until the
            // bitstream is ready.
            if let Err(err) = check(
                unsafe { lock_fn(self.encoder, &mut lock_params) },
                "nvEncLockBitstream",
            ) {
                self.free_outputs.push(output);
                return Err(err);
            }

            // SAFETY: bitstreamBufferPtr is valid for bitstreamSizeInBytes
            // while the lock is held.
            let data = unsafe {
                std::slice::from_raw_parts(
                    lock_params.bitstreamBufferPtr as *const u8,
                    lock_params.bitstreamSizeInBytes as usize,
                )
            }
            .to_vec();
            let keyframe = matches!(
                lock_params.pictureType,
                NV_ENC_PIC_TYPE::NV_ENC_PIC_TYPE_IDR | NV_ENC_PIC_TYPE::NV_ENC_PIC_TYPE_I
            );

            // SAFETY: output was locked above.
            let unlock_status = unsafe { unlock_fn(self.encoder, output) };
            if unlock_status != NVENCSTATUS::NV_ENC_SUCCESS {
                warn!(status = ?unlock_status, "nvEncUnlockBitstream failed");
            }
            self.free_outputs.push(output);
            payloads.push(EncodedPayload { data, keyframe });
        }
        Ok(payloads)
    }
}

impl EncodeBackend for NvEncodeBackend {
    fn input_surface(&self) -> InputSurface {
        self.surface
    }

    fn encode(
        &mut self,
        flag: FrameFlag,
        timestamp_nanos: u64,
        duration_nanos: u64,
    ) -> Result<Vec<EncodedPayload>, BackendError> {
        self.ctx.bind_to_thread().map_err(map_cuda_error)?;

        let map_fn = api(self.fns.nvEncMapInputResource, "nvEncMapInputResource")?;
        let mut map_params: NV_ENC_MAP_INPUT_RESOURCE = unsafe { std::mem::zeroed() };
        map_params.version = NV_ENC_MAP_INPUT_RESOURCE_VER;
        map_params.registeredResource = self.registration;
        // SAFETY: registration was produced by nvEncRegisterResource at open.
        check(
            unsafe { map_fn(self.encoder, &mut map_params) },
            "nvEncMapInputResource",
        )?;
        let mapped = map_params.mappedResource;

        let output = match self.take_output() {
            Ok(output) => output,
            Err(err) => {
                self.unmap_input(mapped);
                return Err(err);
            }
        };

        self.pic_params = unsafe { std::mem::zeroed() };
        self.pic_params.version = NV_ENC_PIC_PARAMS_VER;
        self.pic_params.inputWidth = self.dims.width.get();
        self.pic_params.inputHeight = self.dims.height.get();
        self.pic_params.inputPitch = self.surface.pitch;
        self.pic_params.inputBuffer = mapped;
        self.pic_params.outputBitstream = output;
        self.pic_params.bufferFmt = NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_ARGB;
        self.pic_params.pictureStruct = NV_ENC_PIC_STRUCT::NV_ENC_PIC_STRUCT_FRAME;
        self.pic_params.inputTimeStamp = timestamp_nanos;
        self.pic_params.inputDuration = duration_nanos;
        if flag == FrameFlag::ForceIdr {
            self.pic_params.encodePicFlags = NV_ENC_PIC_FLAGS::NV_ENC_PIC_FLAG_FORCEIDR as u32;
        }

        let encode_fn = api(self.fns.nvEncEncodePicture, "nvEncEncodePicture")?;
        // SAFETY: all handles in pic_params are live NVENC-owned resources.
        let status = unsafe { encode_fn(self.encoder, &mut self.pic_params) };
        // frameIntervalP is pinned to 1, so the mapping is consumed by the
        // time nvEncEncodePicture returns.
        self.unmap_input(mapped);

        match status {
            NVENCSTATUS::NV_ENC_SUCCESS => {
                self.pending_outputs.push_back(output);
                self.collect_pending()
            }
            NVENCSTATUS::NV_ENC_ERR_NEED_MORE_INPUT => {
                self.pending_outputs.push_back(output);
                Ok(Vec::new())
            }
            other => {
                self.free_outputs.push(output);
                Err(map_status(other, "nvEncEncodePicture"))
            }
        }
    }

    fn drain(&mut self) -> Result<Vec<EncodedPayload>, BackendError> {
        self.ctx.bind_to_thread().map_err(map_cuda_error)?;

        let encode_fn = api(self.fns.nvEncEncodePicture, "nvEncEncodePicture")?;
        self.pic_params = unsafe { std::mem::zeroed() };
        self.pic_params.version = NV_ENC_PIC_PARAMS_VER;
        self.pic_params.encodePicFlags = NV_ENC_PIC_FLAGS::NV_ENC_PIC_FLAG_EOS as u32;
        // SAFETY: an EOS picture carries no input buffer.
        check(
            unsafe { encode_fn(self.encoder, &mut self.pic_params) },
            "nvEncEncodePicture (EOS)",
        )?;

        self.collect_pending()
    }
}

impl Drop for NvEncodeBackend {
    fn drop(&mut self) {
        // The CUDA context must be current for NVENC teardown and for the
        // input allocation's release; between the last call and this drop it
        // may have been unbound.
        if let Err(err) = self.ctx.bind_to_thread() {
            warn!(%err, "CUDA bind failed during teardown, GPU resources may leak");
            return;
        }

        if !self.registration.is_null()
            && let Some(unreg_fn) = self.fns.nvEncUnregisterResource
        {
            // SAFETY: registration came from nvEncRegisterResource.
            let status = unsafe { unreg_fn(self.encoder, self.registration) };
            if status != NVENCSTATUS::NV_ENC_SUCCESS {
                warn!(status = ?status, "nvEncUnregisterResource failed during teardown");
            }
        }

        if let Some(destroy_fn) = self.fns.nvEncDestroyBitstreamBuffer {
            for output in self.outputs.drain(..) {
                // SAFETY: output came from nvEncCreateBitstreamBuffer.
                let status = unsafe { destroy_fn(self.encoder, output) };
                if status != NVENCSTATUS::NV_ENC_SUCCESS {
                    warn!(status = ?status, "nvEncDestroyBitstreamBuffer failed during teardown");
                }
            }
        }

        if !self.encoder.is_null()
            && let Some(destroy_fn) = self.fns.nvEncDestroyEncoder
        {
            // SAFETY: encoder came from nvEncOpenEncodeSessionEx.
            let status = unsafe { destroy_fn(self.encoder) };
            if status != NVENCSTATUS::NV_ENC_SUCCESS {
                warn!(status = ?status, "nvEncDestroyEncoder failed during teardown");
            }
        }

        debug!("NVENC session destroyed");
        // The CUDA input allocation is released when the `input` field drops
        // after this body returns.
    }
}

fn api<F: Copy>(slot: Option<F>, name: &'static str) -> Result<F, BackendError> {
    slot.ok_or_else(|| BackendError::Backend(format!("{name} missing from NVENC function list")))
}

fn check(status: NVENCSTATUS, context: &'static str) -> Result<(), BackendError> {
    if status == NVENCSTATUS::NV_ENC_SUCCESS {
        Ok(())
    } else {
        Err(map_status(status, context))
    }
}

fn map_status(status: NVENCSTATUS, context: &'static str) -> BackendError {
    let detail = format!("{context} failed: {status:?}");
    match status {
        NVENCSTATUS::NV_ENC_ERR_ENCODER_BUSY
        | NVENCSTATUS::NV_ENC_ERR_LOCK_BUSY
        | NVENCSTATUS::NV_ENC_ERR_NEED_MORE_INPUT => BackendError::TemporaryBackpressure(detail),
        NVENCSTATUS::NV_ENC_ERR_DEVICE_NOT_EXIST => BackendError::DeviceLost(detail),
        NVENCSTATUS::NV_ENC_ERR_UNSUPPORTED_DEVICE
        | NVENCSTATUS::NV_ENC_ERR_UNSUPPORTED_PARAM
        | NVENCSTATUS::NV_ENC_ERR_NO_ENCODE_DEVICE
        | NVENCSTATUS::NV_ENC_ERR_INVALID_ENCODERDEVICE => BackendError::UnsupportedConfig(detail),
        NVENCSTATUS::NV_ENC_ERR_INVALID_PARAM | NVENCSTATUS::NV_ENC_ERR_INVALID_CALL => {
            BackendError::InvalidInput(detail)
        }
        _ => BackendError::Backend(detail),
    }
}

fn map_cuda_error(err: cudarc::driver::DriverError) -> BackendError {
    BackendError::Backend(format!("cuda driver error: {err}"))
}

fn encode_guid(codec: Codec) -> GUID {
    match codec {
        Codec::H264 => NV_ENC_CODEC_H264_GUID,
        Codec::Hevc => NV_ENC_CODEC_HEVC_GUID,
    }
}

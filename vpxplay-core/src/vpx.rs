//! # libvpx Decoder
//!
//! VP8/VP9 software decoding through libvpx, loaded at runtime with
//! libloading so the player builds without libvpx headers or import libs.
//!
//! ## Session lifecycle
//! 1. `vpx_codec_dec_init_ver` binds a context to the VP8 or VP9 interface
//! 2. `vpx_codec_decode` consumes one compressed payload
//! 3. `vpx_codec_get_frame` is iterated until it returns null
//! 4. `vpx_codec_destroy` on drop

use std::ffi::{c_char, c_int, c_long, c_uint, c_void, CStr};
use std::ptr;
use std::sync::OnceLock;

use crate::decode::{chroma_rows, Codec, CodecSession, DecodeError, DecodedFrame, Plane};

// ============================================================================
// libvpx ABI
// ============================================================================

type VpxCodecErr = c_int;
type VpxCodecIter = *const c_void;

const VPX_CODEC_OK: VpxCodecErr = 0;
/// VPX_DECODER_ABI_VERSION for libvpx 1.8 and later.
const VPX_DECODER_ABI_VERSION: c_int = 12;

const VPX_IMG_FMT_PLANAR: c_int = 0x100;
const VPX_IMG_FMT_HIGHBITDEPTH: c_int = 0x800;
pub const VPX_IMG_FMT_YV12: c_int = 0x301;
pub const VPX_IMG_FMT_I420: c_int = 0x102;

#[repr(C)]
struct VpxCodecIface {
    _private: [u8; 0],
}

#[repr(C)]
struct VpxCodecDecCfg {
    threads: c_uint,
    w: c_uint,
    h: c_uint,
}

#[repr(C)]
struct VpxCodecCtx {
    name: *const c_char,
    iface: *mut VpxCodecIface,
    err: VpxCodecErr,
    err_detail: *const c_char,
    init_flags: c_long,
    config: *const c_void,
    priv_: *mut c_void,
}

#[repr(C)]
pub struct VpxImage {
    pub fmt: c_int,
    pub cs: c_int,
    pub range: c_int,
    pub w: c_uint,
    pub h: c_uint,
    pub bit_depth: c_uint,
    pub d_w: c_uint,
    pub d_h: c_uint,
    pub r_w: c_uint,
    pub r_h: c_uint,
    pub x_chroma_shift: c_uint,
    pub y_chroma_shift: c_uint,
    pub planes: [*mut u8; 4],
    pub stride: [c_int; 4],
    pub bps: c_int,
    pub user_priv: *mut c_void,
    pub img_data: *mut u8,
    pub img_data_owner: c_int,
    pub self_allocd: c_int,
    pub fb_priv: *mut c_void,
}

// ============================================================================
// Library Path Detection
// ============================================================================

#[cfg(target_os = "windows")]
fn vpx_lib_candidates() -> &'static [&'static str] {
    &["vpx.dll", "libvpx.dll", "libvpx-1.dll"]
}

#[cfg(target_os = "macos")]
fn vpx_lib_candidates() -> &'static [&'static str] {
    &[
        "libvpx.dylib",
        "/opt/homebrew/lib/libvpx.dylib",
        "/usr/local/lib/libvpx.dylib",
    ]
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn vpx_lib_candidates() -> &'static [&'static str] {
    &[
        "libvpx.so.9",
        "libvpx.so.8",
        "libvpx.so.7",
        "libvpx.so.6",
        "libvpx.so",
    ]
}

// ============================================================================
// Function Types
// ============================================================================

type VpxCodecIfaceFn = unsafe extern "C" fn() -> *mut VpxCodecIface;
type VpxCodecDecInitVerFn = unsafe extern "C" fn(
    *mut VpxCodecCtx,
    *mut VpxCodecIface,
    *const VpxCodecDecCfg,
    c_long,
    c_int,
) -> VpxCodecErr;
type VpxCodecDecodeFn =
    unsafe extern "C" fn(*mut VpxCodecCtx, *const u8, c_uint, *mut c_void, c_long) -> VpxCodecErr;
type VpxCodecGetFrameFn = unsafe extern "C" fn(*mut VpxCodecCtx, *mut VpxCodecIter) -> *mut VpxImage;
type VpxCodecDestroyFn = unsafe extern "C" fn(*mut VpxCodecCtx) -> VpxCodecErr;
type VpxCodecIfaceNameFn = unsafe extern "C" fn(*mut VpxCodecIface) -> *const c_char;
type VpxCodecErrToStringFn = unsafe extern "C" fn(VpxCodecErr) -> *const c_char;
type VpxCodecErrorDetailFn = unsafe extern "C" fn(*const VpxCodecCtx) -> *const c_char;

// ============================================================================
// Loaded Functions Container
// ============================================================================

struct VpxLibrary {
    _lib: libloading::Library,

    vp8_dx: VpxCodecIfaceFn,
    vp9_dx: VpxCodecIfaceFn,
    dec_init_ver: VpxCodecDecInitVerFn,
    decode: VpxCodecDecodeFn,
    get_frame: VpxCodecGetFrameFn,
    destroy: VpxCodecDestroyFn,
    iface_name: VpxCodecIfaceNameFn,
    err_to_string: VpxCodecErrToStringFn,
    error_detail: VpxCodecErrorDetailFn,
}

unsafe impl Send for VpxLibrary {}
unsafe impl Sync for VpxLibrary {}

static VPX_LIB: OnceLock<Option<VpxLibrary>> = OnceLock::new();

fn load_vpx_library() -> Option<&'static VpxLibrary> {
    VPX_LIB
        .get_or_init(|| {
            let lib = vpx_lib_candidates().iter().find_map(|path| {
                match unsafe { libloading::Library::new(path) } {
                    Ok(lib) => {
                        tracing::debug!("Loaded libvpx from {}", path);
                        Some(lib)
                    }
                    Err(e) => {
                        tracing::trace!("libvpx not at {}: {}", path, e);
                        None
                    }
                }
            });
            let Some(lib) = lib else {
                tracing::warn!("Failed to load libvpx (tried {:?})", vpx_lib_candidates());
                return None;
            };

            unsafe {
                let vp8_dx: VpxCodecIfaceFn = *lib.get(b"vpx_codec_vp8_dx\0").ok()?;
                let vp9_dx: VpxCodecIfaceFn = *lib.get(b"vpx_codec_vp9_dx\0").ok()?;
                let dec_init_ver: VpxCodecDecInitVerFn =
                    *lib.get(b"vpx_codec_dec_init_ver\0").ok()?;
                let decode: VpxCodecDecodeFn = *lib.get(b"vpx_codec_decode\0").ok()?;
                let get_frame: VpxCodecGetFrameFn = *lib.get(b"vpx_codec_get_frame\0").ok()?;
                let destroy: VpxCodecDestroyFn = *lib.get(b"vpx_codec_destroy\0").ok()?;
                let iface_name: VpxCodecIfaceNameFn = *lib.get(b"vpx_codec_iface_name\0").ok()?;
                let err_to_string: VpxCodecErrToStringFn =
                    *lib.get(b"vpx_codec_err_to_string\0").ok()?;
                let error_detail: VpxCodecErrorDetailFn =
                    *lib.get(b"vpx_codec_error_detail\0").ok()?;

                Some(VpxLibrary {
                    _lib: lib,
                    vp8_dx,
                    vp9_dx,
                    dec_init_ver,
                    decode,
                    get_frame,
                    destroy,
                    iface_name,
                    err_to_string,
                    error_detail,
                })
            }
        })
        .as_ref()
}

/// Whether libvpx can be loaded on this machine.
pub fn is_available() -> bool {
    load_vpx_library().is_some()
}

fn c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

// ============================================================================
// VPX Session
// ============================================================================

pub struct VpxSession {
    libs: &'static VpxLibrary,
    // Boxed so the context keeps a stable address for libvpx
    ctx: Box<VpxCodecCtx>,
    codec: Codec,
    name: String,
    iter: VpxCodecIter,
    last_decode_failed: bool,
}

// The context is only touched through &mut self.
unsafe impl Send for VpxSession {}

impl VpxSession {
    /// Initialize a decoder. `threads == 0` lets libvpx pick.
    pub fn open(codec: Codec, threads: u32) -> Result<Self, DecodeError> {
        let libs = load_vpx_library()
            .ok_or_else(|| DecodeError::LibraryUnavailable("libvpx could not be loaded".into()))?;

        let mut ctx = Box::new(VpxCodecCtx {
            name: ptr::null(),
            iface: ptr::null_mut(),
            err: VPX_CODEC_OK,
            err_detail: ptr::null(),
            init_flags: 0,
            config: ptr::null(),
            priv_: ptr::null_mut(),
        });
        let cfg = VpxCodecDecCfg {
            threads,
            w: 0,
            h: 0,
        };

        let name = unsafe {
            let iface = match codec {
                Codec::Vp8 => (libs.vp8_dx)(),
                Codec::Vp9 => (libs.vp9_dx)(),
            };
            if iface.is_null() {
                return Err(DecodeError::Init(format!("libvpx has no {} decoder", codec.name())));
            }
            let result = (libs.dec_init_ver)(&mut *ctx, iface, &cfg, 0, VPX_DECODER_ABI_VERSION);
            if result != VPX_CODEC_OK {
                let message = c_string((libs.err_to_string)(result)).unwrap_or_default();
                return Err(DecodeError::Init(format!(
                    "vpx_codec_dec_init failed ({}): {}",
                    result, message
                )));
            }
            c_string((libs.iface_name)(iface)).unwrap_or_else(|| format!("libvpx {}", codec.name()))
        };

        Ok(Self {
            libs,
            ctx,
            codec,
            name,
            iter: ptr::null(),
            last_decode_failed: false,
        })
    }

    fn last_error(&self, result: VpxCodecErr) -> String {
        let message = c_string(unsafe { (self.libs.err_to_string)(result) }).unwrap_or_default();
        match c_string(unsafe { (self.libs.error_detail)(&*self.ctx) }) {
            Some(detail) => format!("{} ({})", message, detail),
            None => message,
        }
    }
}

impl CodecSession for VpxSession {
    fn codec(&self) -> Codec {
        self.codec
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        self.iter = ptr::null();
        self.last_decode_failed = true;
        if data.is_empty() {
            return Err(DecodeError::DecodeFailed("empty payload".into()));
        }
        let len = c_uint::try_from(data.len())
            .map_err(|_| DecodeError::DecodeFailed(format!("payload too large: {}", data.len())))?;

        let result = unsafe {
            (self.libs.decode)(&mut *self.ctx, data.as_ptr(), len, ptr::null_mut(), 0)
        };
        if result != VPX_CODEC_OK {
            return Err(DecodeError::DecodeFailed(self.last_error(result)));
        }
        self.last_decode_failed = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Option<DecodedFrame<'_>> {
        if self.last_decode_failed {
            return None;
        }
        let image = unsafe { (self.libs.get_frame)(&mut *self.ctx, &mut self.iter) };
        if image.is_null() {
            return None;
        }
        // The image stays valid until the next decode call, which needs &mut self.
        match unsafe { frame_from_image(&*image) } {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!("{}: {}", self.name, e);
                None
            }
        }
    }
}

impl Drop for VpxSession {
    fn drop(&mut self) {
        let result = unsafe { (self.libs.destroy)(&mut *self.ctx) };
        if result != VPX_CODEC_OK {
            tracing::warn!("vpx_codec_destroy failed: {}", result);
        }
    }
}

/// Borrow the planes of an 8-bit 4:2:0 libvpx image.
///
/// # Safety
/// `image.planes[0..3]` must point at buffers of at least `stride * rows`
/// bytes that outlive `'a`.
unsafe fn frame_from_image<'a>(image: &'a VpxImage) -> Result<DecodedFrame<'a>, DecodeError> {
    if image.fmt & VPX_IMG_FMT_HIGHBITDEPTH != 0 {
        return Err(DecodeError::UnsupportedImage(format!(
            "high bit depth image ({} bits)",
            image.bit_depth
        )));
    }
    if image.fmt & VPX_IMG_FMT_PLANAR == 0 || image.x_chroma_shift != 1 || image.y_chroma_shift != 1 {
        return Err(DecodeError::UnsupportedImage(format!(
            "format {:#x} is not 4:2:0 planar",
            image.fmt
        )));
    }

    let rows = [
        image.d_h as usize,
        chroma_rows(image.d_h),
        chroma_rows(image.d_h),
    ];
    let mut planes = [Plane { data: &[], stride: 0, rows: 0 }; 3];
    for (index, plane) in planes.iter_mut().enumerate() {
        let base = image.planes[index];
        let stride = usize::try_from(image.stride[index]).unwrap_or(0);
        if base.is_null() || stride == 0 {
            return Err(DecodeError::UnsupportedImage(format!("plane {} is missing", index)));
        }
        *plane = Plane {
            data: std::slice::from_raw_parts(base, stride * rows[index]),
            stride,
            rows: rows[index],
        };
    }

    Ok(DecodedFrame {
        width: image.d_w,
        height: image.d_h,
        planes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(fmt: c_int, planes: &mut [Vec<u8>; 3], strides: [c_int; 3], d_w: u32, d_h: u32) -> VpxImage {
        VpxImage {
            fmt,
            cs: 0,
            range: 0,
            w: d_w,
            h: d_h,
            bit_depth: 8,
            d_w,
            d_h,
            r_w: 0,
            r_h: 0,
            x_chroma_shift: 1,
            y_chroma_shift: 1,
            planes: [
                planes[0].as_mut_ptr(),
                planes[1].as_mut_ptr(),
                planes[2].as_mut_ptr(),
                ptr::null_mut(),
            ],
            stride: [strides[0], strides[1], strides[2], 0],
            bps: 12,
            user_priv: ptr::null_mut(),
            img_data: ptr::null_mut(),
            img_data_owner: 0,
            self_allocd: 0,
            fb_priv: ptr::null_mut(),
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn abi_struct_sizes_match_libvpx() {
        assert_eq!(std::mem::size_of::<VpxImage>(), 136);
        assert_eq!(std::mem::size_of::<VpxCodecCtx>(), 56);
        assert_eq!(std::mem::size_of::<VpxCodecDecCfg>(), 12);
    }

    #[test]
    fn borrows_planes_with_padded_strides() {
        let mut planes = [vec![1u8; 8 * 5], vec![2u8; 4 * 3], vec![3u8; 4 * 3]];
        let img = image(VPX_IMG_FMT_I420, &mut planes, [8, 4, 4], 6, 5);

        let frame = unsafe { frame_from_image(&img) }.unwrap();
        assert_eq!((frame.width, frame.height), (6, 5));
        assert_eq!(frame.luma().stride, 8);
        assert_eq!(frame.planes[0].rows, 5);
        assert_eq!(frame.planes[1].rows, 3);
        assert_eq!(frame.planes[2].data.len(), 12);
        assert!(frame.planes[2].data.iter().all(|b| *b == 3));
    }

    #[test]
    fn rejects_high_bit_depth_images() {
        let mut planes = [vec![0u8; 16], vec![0u8; 8], vec![0u8; 8]];
        let img = image(VPX_IMG_FMT_I420 | VPX_IMG_FMT_HIGHBITDEPTH, &mut planes, [4, 2, 2], 2, 2);
        let err = unsafe { frame_from_image(&img) }.err().unwrap();
        assert!(matches!(err, DecodeError::UnsupportedImage(_)));
    }

    #[test]
    fn rejects_missing_planes() {
        let mut planes = [vec![0u8; 16], vec![0u8; 8], vec![0u8; 8]];
        let mut img = image(VPX_IMG_FMT_YV12, &mut planes, [4, 2, 2], 2, 2);
        img.planes[2] = ptr::null_mut();
        assert!(unsafe { frame_from_image(&img) }.is_err());
    }
}

//! Minimal JNI surface used by the loader.
//!
//! Only the handful of `JNIEnv` functions needed to read specialization
//! arguments and to rewrite the descriptor-exemption array are bound. They
//! are reached through their fixed indices in the JNI function table.

#![allow(non_camel_case_types)]

use core::ffi::{c_char, c_void};
use std::ffi::CStr;

pub type jint = i32;
pub type jlong = i64;
pub type jboolean = u8;
pub type jsize = jint;
pub type jobject = *mut c_void;
pub type jstring = jobject;
pub type jarray = jobject;
pub type jintArray = jarray;
pub type jobjectArray = jarray;

/// Pointer to the JNI function table (`const JNINativeInterface*`).
pub type JNIEnv = *const *const c_void;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct JNINativeMethod {
    pub name: *const c_char,
    pub signature: *const c_char,
    pub fn_ptr: *mut c_void,
}

const GET_STRING_UTF_CHARS: usize = 169;
const RELEASE_STRING_UTF_CHARS: usize = 170;
const GET_ARRAY_LENGTH: usize = 171;
const NEW_INT_ARRAY: usize = 179;
const GET_INT_ARRAY_REGION: usize = 203;
const SET_INT_ARRAY_REGION: usize = 211;

/// What the engine needs from the managed runtime.
///
/// Null handles always read back as `None`.
pub trait Runtime {
    /// Raw environment handed to modules.
    fn env(&self) -> *mut JNIEnv;

    fn string(&self, value: jstring) -> Option<String>;

    fn int_array(&self, array: jintArray) -> Option<Vec<jint>>;

    fn new_int_array(&self, values: &[jint]) -> Option<jintArray>;
}

/// [`Runtime`] over a live `JNIEnv*`.
pub struct JniRuntime {
    env: *mut JNIEnv,
}

type GetStringUtfChars = unsafe extern "C" fn(*mut JNIEnv, jstring, *mut jboolean) -> *const c_char;
type ReleaseStringUtfChars = unsafe extern "C" fn(*mut JNIEnv, jstring, *const c_char);
type GetArrayLength = unsafe extern "C" fn(*mut JNIEnv, jarray) -> jsize;
type NewIntArray = unsafe extern "C" fn(*mut JNIEnv, jsize) -> jintArray;
type GetIntArrayRegion = unsafe extern "C" fn(*mut JNIEnv, jintArray, jsize, jsize, *mut jint);
type SetIntArrayRegion = unsafe extern "C" fn(*mut JNIEnv, jintArray, jsize, jsize, *const jint);

impl JniRuntime {
    /// # Safety
    /// `env` must be a valid `JNIEnv*` attached to the calling thread for the
    /// lifetime of the returned value.
    pub unsafe fn from_raw(env: *mut JNIEnv) -> Option<Self> {
        if env.is_null() || unsafe { (*env).is_null() } { None } else { Some(Self { env }) }
    }

    /// Fetch entry `index` of the function table as `F`.
    unsafe fn function<F: Copy>(&self, index: usize) -> F {
        debug_assert_eq!(core::mem::size_of::<F>(), core::mem::size_of::<*const c_void>());
        unsafe {
            let table = *self.env;
            let entry = table.add(index);
            core::mem::transmute_copy::<*const c_void, F>(&*entry)
        }
    }
}

impl Runtime for JniRuntime {
    fn env(&self) -> *mut JNIEnv {
        self.env
    }

    fn string(&self, value: jstring) -> Option<String> {
        if value.is_null() {
            return None;
        }
        unsafe {
            let get: GetStringUtfChars = self.function(GET_STRING_UTF_CHARS);
            let release: ReleaseStringUtfChars = self.function(RELEASE_STRING_UTF_CHARS);
            let chars = get(self.env, value, core::ptr::null_mut());
            if chars.is_null() {
                return None;
            }
            let owned = CStr::from_ptr(chars).to_string_lossy().into_owned();
            release(self.env, value, chars);
            Some(owned)
        }
    }

    fn int_array(&self, array: jintArray) -> Option<Vec<jint>> {
        if array.is_null() {
            return None;
        }
        unsafe {
            let len: GetArrayLength = self.function(GET_ARRAY_LENGTH);
            let region: GetIntArrayRegion = self.function(GET_INT_ARRAY_REGION);
            let n = len(self.env, array);
            if n < 0 {
                return None;
            }
            let mut values = vec![0; n as usize];
            region(self.env, array, 0, n, values.as_mut_ptr());
            Some(values)
        }
    }

    fn new_int_array(&self, values: &[jint]) -> Option<jintArray> {
        let n = jsize::try_from(values.len()).ok()?;
        unsafe {
            let new: NewIntArray = self.function(NEW_INT_ARRAY);
            let set: SetIntArrayRegion = self.function(SET_INT_ARRAY_REGION);
            let array = new(self.env, n);
            if array.is_null() {
                return None;
            }
            set(self.env, array, 0, n, values.as_ptr());
            Some(array)
        }
    }
}

//! windows
//!
//! Forward threadpool operations to the Windows threadpool. The entry points are resolved from
//! kernel32 at runtime so hosts without the Vista threadpool api fall back to the portable
//! backend.
//!
//! https://learn.microsoft.com/en-us/windows/win32/procthread/thread-pool-api

use super::native::{NativeCallback, NativeEnvironment, NativeHandle, NativeThreadpool};
use parking_lot::Mutex;
use std::{collections::HashMap, ffi::c_void, io, mem};
use tracing::{debug, warn};
use windows_sys::Win32::{
    Foundation::{BOOL, FALSE, TRUE},
    System::{
        LibraryLoader::{GetProcAddress, LoadLibraryA},
        Threading::{
            PTP_CALLBACK_INSTANCE, PTP_CLEANUP_GROUP, PTP_POOL, PTP_SIMPLE_CALLBACK, PTP_WORK,
            PTP_WORK_CALLBACK, TP_CALLBACK_ENVIRON_V3, TP_CALLBACK_PRIORITY_NORMAL,
            TP_POOL_STACK_INFORMATION,
        },
    },
};

type CreateThreadpool = unsafe extern "system" fn(*const c_void) -> PTP_POOL;
type CloseThreadpool = unsafe extern "system" fn(PTP_POOL);
type SetThreadpoolThreadMinimum = unsafe extern "system" fn(PTP_POOL, u32) -> BOOL;
type SetThreadpoolThreadMaximum = unsafe extern "system" fn(PTP_POOL, u32);
type SetThreadpoolStackInformation =
    unsafe extern "system" fn(PTP_POOL, *const TP_POOL_STACK_INFORMATION) -> BOOL;
type CreateThreadpoolCleanupGroup = unsafe extern "system" fn() -> PTP_CLEANUP_GROUP;
type CloseThreadpoolCleanupGroupMembers =
    unsafe extern "system" fn(PTP_CLEANUP_GROUP, BOOL, *mut c_void);
type CloseThreadpoolCleanupGroup = unsafe extern "system" fn(PTP_CLEANUP_GROUP);
type CreateThreadpoolWork = unsafe extern "system" fn(
    PTP_WORK_CALLBACK,
    *mut c_void,
    *const TP_CALLBACK_ENVIRON_V3,
) -> PTP_WORK;
type SubmitThreadpoolWork = unsafe extern "system" fn(PTP_WORK);
type WaitForThreadpoolWorkCallbacks = unsafe extern "system" fn(PTP_WORK, BOOL);
type CloseThreadpoolWork = unsafe extern "system" fn(PTP_WORK);
type TrySubmitThreadpoolCallback = unsafe extern "system" fn(
    PTP_SIMPLE_CALLBACK,
    *mut c_void,
    *const TP_CALLBACK_ENVIRON_V3,
) -> BOOL;

/// Resolve a kernel32 export as a typed function pointer
///
/// Safety: `F` must be the function pointer type of the export named by `name`
unsafe fn resolve<F: Copy>(module: isize, name: &[u8]) -> Option<F> {
    debug_assert_eq!(Some(&0), name.last(), "symbol names are nul terminated");
    let proc = GetProcAddress(module as _, name.as_ptr())?;
    Some(mem::transmute_copy(&proc))
}

/// A work object's callback and the cleanup group it was created in
struct WorkContext {
    callback: *mut NativeCallback,
    group: Option<NativeHandle>,
}

/// The Windows threadpool api resolved from kernel32
pub(crate) struct Kernel32Threadpool {
    create_pool: CreateThreadpool,
    close_pool: CloseThreadpool,
    set_minimum: SetThreadpoolThreadMinimum,
    set_maximum: SetThreadpoolThreadMaximum,
    set_stack: SetThreadpoolStackInformation,
    create_group: CreateThreadpoolCleanupGroup,
    close_group_members: CloseThreadpoolCleanupGroupMembers,
    close_group: CloseThreadpoolCleanupGroup,
    create_work: CreateThreadpoolWork,
    submit_work: SubmitThreadpoolWork,
    wait_work: WaitForThreadpoolWorkCallbacks,
    close_work: CloseThreadpoolWork,
    try_submit: TrySubmitThreadpoolCallback,
    /// Callback contexts by work handle. Freed once the kernel can no longer call them
    works: Mutex<HashMap<NativeHandle, WorkContext>>,
}

// The raw callback pointers are only dereferenced by the kernel callbacks and freed under lock
unsafe impl Send for Kernel32Threadpool {}
unsafe impl Sync for Kernel32Threadpool {}

impl Kernel32Threadpool {
    /// Resolve every threadpool entry point. Returns None unless all of them are present
    pub(crate) fn load() -> Option<Self> {
        unsafe {
            let kernel32 = LoadLibraryA(b"kernel32.dll\0".as_ptr());
            if kernel32 == 0 {
                warn!("failed to load kernel32");
                return None;
            }
            let module = kernel32 as isize;
            let api = Self {
                create_pool: resolve(module, b"CreateThreadpool\0")?,
                close_pool: resolve(module, b"CloseThreadpool\0")?,
                set_minimum: resolve(module, b"SetThreadpoolThreadMinimum\0")?,
                set_maximum: resolve(module, b"SetThreadpoolThreadMaximum\0")?,
                set_stack: resolve(module, b"SetThreadpoolStackInformation\0")?,
                create_group: resolve(module, b"CreateThreadpoolCleanupGroup\0")?,
                close_group_members: resolve(module, b"CloseThreadpoolCleanupGroupMembers\0")?,
                close_group: resolve(module, b"CloseThreadpoolCleanupGroup\0")?,
                create_work: resolve(module, b"CreateThreadpoolWork\0")?,
                submit_work: resolve(module, b"SubmitThreadpoolWork\0")?,
                wait_work: resolve(module, b"WaitForThreadpoolWorkCallbacks\0")?,
                close_work: resolve(module, b"CloseThreadpoolWork\0")?,
                try_submit: resolve(module, b"TrySubmitThreadpoolCallback\0")?,
                works: Mutex::new(HashMap::new()),
            };
            debug!("resolved kernel32 threadpool api");
            Some(api)
        }
    }
}

/// Initialize a callback environment.
///
/// NOTE: InitializeThreadpoolEnvironment and friends are macro functions (not exported from
/// windows_sys crate).
///
/// [See also]
/// (https://learn.microsoft.com/en-us/windows/win32/api/winbase/nf-winbase-initializethreadpoolenvironment)
fn raw_environment(env: &NativeEnvironment) -> TP_CALLBACK_ENVIRON_V3 {
    let mut raw = unsafe { mem::zeroed::<TP_CALLBACK_ENVIRON_V3>() };
    raw.Version = 3;
    raw.CallbackPriority = TP_CALLBACK_PRIORITY_NORMAL;
    raw.Size = mem::size_of::<TP_CALLBACK_ENVIRON_V3>() as _;
    raw.Pool = env.pool.map_or(0, |pool| pool.0 as PTP_POOL);
    raw.CleanupGroup = env.cleanup_group.map_or(0, |group| group.0 as PTP_CLEANUP_GROUP);
    raw.u.Flags = env.flags.bits();
    raw
}

impl NativeThreadpool for Kernel32Threadpool {
    fn name(&self) -> &'static str {
        "kernel32"
    }

    /// [See also]
    /// (https://learn.microsoft.com/en-us/windows/win32/api/threadpoolapiset/nf-threadpoolapiset-createthreadpool)
    fn create_pool(&self) -> io::Result<NativeHandle> {
        match unsafe { (self.create_pool)(std::ptr::null()) } {
            0 => Err(io::Error::last_os_error()),
            handle => Ok(NativeHandle(handle as usize)),
        }
    }

    /// [See also]
    /// (https://learn.microsoft.com/en-us/windows/win32/api/threadpoolapiset/nf-threadpoolapiset-setthreadpoolthreadminimum)
    fn set_thread_minimum(&self, pool: NativeHandle, min: u32) -> io::Result<()> {
        match unsafe { (self.set_minimum)(pool.0 as _, min) } {
            TRUE => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// [See also]
    /// (https://learn.microsoft.com/en-us/windows/win32/api/threadpoolapiset/nf-threadpoolapiset-setthreadpoolthreadmaximum)
    fn set_thread_maximum(&self, pool: NativeHandle, max: u32) {
        unsafe { (self.set_maximum)(pool.0 as _, max) }
    }

    /// [See also]
    /// (https://learn.microsoft.com/en-us/windows/win32/api/threadpoolapiset/nf-threadpoolapiset-setthreadpoolstackinformation)
    fn set_stack_information(
        &self,
        pool: NativeHandle,
        reserve: usize,
        commit: usize,
    ) -> io::Result<()> {
        let stack = TP_POOL_STACK_INFORMATION {
            StackReserve: reserve,
            StackCommit: commit,
        };
        match unsafe { (self.set_stack)(pool.0 as _, &stack) } {
            FALSE => Err(io::Error::last_os_error()),
            _ => Ok(()),
        }
    }

    fn close_pool(&self, pool: NativeHandle) {
        unsafe { (self.close_pool)(pool.0 as _) }
    }

    fn create_cleanup_group(&self) -> io::Result<NativeHandle> {
        match unsafe { (self.create_group)() } {
            0 => Err(io::Error::last_os_error()),
            handle => Ok(NativeHandle(handle as usize)),
        }
    }

    /// Members of the group are released by the kernel, so their callback contexts are freed
    /// here once the kernel has waited for them
    fn close_cleanup_group_members(&self, group: NativeHandle, cancel_pending: bool) {
        let cancel = match cancel_pending {
            true => TRUE,
            false => FALSE,
        };
        unsafe { (self.close_group_members)(group.0 as _, cancel, std::ptr::null_mut()) };
        let mut works = self.works.lock();
        works.retain(|_, cx| match cx.group == Some(group) {
            true => {
                drop(unsafe { Box::from_raw(cx.callback) });
                false
            }
            false => true,
        });
    }

    fn close_cleanup_group(&self, group: NativeHandle) {
        unsafe { (self.close_group)(group.0 as _) }
    }

    /// [See also]
    /// (https://learn.microsoft.com/en-us/windows/win32/api/threadpoolapiset/nf-threadpoolapiset-createthreadpoolwork)
    fn create_work(
        &self,
        callback: NativeCallback,
        env: &NativeEnvironment,
    ) -> io::Result<NativeHandle> {
        let raw_env = raw_environment(env);
        let cx = Box::into_raw(Box::new(callback));
        let handle = unsafe { (self.create_work)(Some(work_callback), cx as _, &raw_env) };
        match handle {
            0 => {
                drop(unsafe { Box::from_raw(cx) });
                Err(io::Error::last_os_error())
            }
            handle => {
                let handle = NativeHandle(handle as usize);
                self.works.lock().insert(
                    handle,
                    WorkContext {
                        callback: cx,
                        group: env.cleanup_group,
                    },
                );
                Ok(handle)
            }
        }
    }

    /// [See also]
    /// (https://learn.microsoft.com/en-us/windows/win32/api/threadpoolapiset/nf-threadpoolapiset-submitthreadpoolwork)
    fn submit_work(&self, work: NativeHandle) {
        unsafe { (self.submit_work)(work.0 as _) }
    }

    /// [See also]
    /// (https://learn.microsoft.com/en-us/windows/win32/api/threadpoolapiset/nf-threadpoolapiset-waitforthreadpoolworkcallbacks)
    fn wait_for_work_callbacks(&self, work: NativeHandle, cancel_pending: bool) {
        let cancel = match cancel_pending {
            true => TRUE,
            false => FALSE,
        };
        unsafe { (self.wait_work)(work.0 as _, cancel) }
    }

    /// Outstanding callbacks are allowed to finish before the context is freed
    ///
    /// [See also]
    /// (https://learn.microsoft.com/en-us/windows/win32/api/threadpoolapiset/nf-threadpoolapiset-closethreadpoolwork)
    fn close_work(&self, work: NativeHandle) {
        unsafe { (self.wait_work)(work.0 as _, FALSE) };
        unsafe { (self.close_work)(work.0 as _) };
        if let Some(cx) = self.works.lock().remove(&work) {
            drop(unsafe { Box::from_raw(cx.callback) });
        }
    }

    /// [See also]
    /// (https://learn.microsoft.com/en-us/windows/win32/api/threadpoolapiset/nf-threadpoolapiset-trysubmitthreadpoolcallback)
    fn try_submit_callback(
        &self,
        callback: NativeCallback,
        env: &NativeEnvironment,
    ) -> io::Result<()> {
        let raw_env = raw_environment(env);
        let cx = Box::into_raw(Box::new(callback));
        match unsafe { (self.try_submit)(Some(simple_callback), cx as _, &raw_env) } {
            FALSE => {
                drop(unsafe { Box::from_raw(cx) });
                Err(io::Error::last_os_error())
            }
            _ => Ok(()),
        }
    }
}

/// Run a work object's callback. The context lives until the work object is closed
unsafe extern "system" fn work_callback(
    _instance: PTP_CALLBACK_INSTANCE,
    context: *mut c_void,
    _work: PTP_WORK,
) {
    let callback = &*(context as *const NativeCallback);
    (callback)()
}

/// Run a one shot callback and free its context
unsafe extern "system" fn simple_callback(_instance: PTP_CALLBACK_INSTANCE, context: *mut c_void) {
    let callback = Box::from_raw(context as *mut NativeCallback);
    (callback)()
}

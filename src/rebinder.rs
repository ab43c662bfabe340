//! Registration entry points and the image-load notifier

use crate::{
    Result,
    dyld::{Dyld, LoadedImage},
    layout::ImageLayout,
    mmap::Mmap,
    patch::patch_section,
    registry::{Batch, Prepended, Registry, TransientBatch},
    Rebinding,
};
use core::{
    ffi::c_void,
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};

/// Every batch ever passed to [`Rebinder::register`], newest first.
static REGISTRY: Registry = Registry::new();

/// Set once the add-image callback has been handed to the loader.
static NOTIFIER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Whether the process-wide image-load notifier has been installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifierState {
    /// No global registration has happened yet.
    Unregistered,
    /// The notifier is installed and the registry holds at least one batch.
    /// There is no way back to [`NotifierState::Unregistered`].
    Registered,
}

/// Returns the current state of the image-load notifier.
#[inline]
pub fn notifier_state() -> NotifierState {
    if NOTIFIER_INSTALLED.load(Ordering::Acquire) {
        NotifierState::Registered
    } else {
        NotifierState::Unregistered
    }
}

/// Rebinds symbols through a loader backend `D` and a protection backend `M`.
///
/// # Examples
/// ```rust,ignore
/// use core::sync::atomic::AtomicPtr;
/// use macho_rebind::{Rebinder, Rebinding, dyld::DefaultDyld, mmap::DefaultMmap};
///
/// static ORIGINAL_OPEN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
///
/// extern "C" fn my_open(path: *const i8, flags: i32) -> i32 {
///     // forward through ORIGINAL_OPEN
///     # 0
/// }
///
/// let rebinder = Rebinder::<DefaultDyld, DefaultMmap>::new();
/// unsafe {
///     rebinder.register(&[
///         Rebinding::new("open", my_open as *const ()).with_replaced(&ORIGINAL_OPEN),
///     ])
/// }
/// .unwrap();
/// ```
pub struct Rebinder<D: Dyld, M: Mmap> {
    _marker: PhantomData<(D, M)>,
}

impl<D: Dyld, M: Mmap> Default for Rebinder<D, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dyld, M: Mmap> Rebinder<D, M> {
    /// Creates a rebinder using the given backends.
    #[inline]
    pub const fn new() -> Self {
        Rebinder {
            _marker: PhantomData,
        }
    }

    /// Returns a new rebinder with a custom `Mmap` implementation.
    #[inline]
    pub fn with_mmap<NewMmap: Mmap>(self) -> Rebinder<D, NewMmap> {
        Rebinder::new()
    }

    /// Returns a new rebinder with a custom `Dyld` implementation.
    #[inline]
    pub fn with_dyld<NewDyld: Dyld>(self) -> Rebinder<NewDyld, M> {
        Rebinder::new()
    }

    /// Adds `rebindings` to the process-wide registry and applies it.
    ///
    /// The first call installs the image-load notifier; the loader replays it
    /// for every image already loaded, and from then on every newly loaded
    /// image is rebound against the whole registry. Later calls rewalk every
    /// loaded image themselves. Either way, rebinding a symbol that was
    /// already rebound by an earlier call lets the newest replacement win.
    ///
    /// Only fails when the batch cannot be stored, in which case nothing was
    /// registered. Images that cannot be rebound are skipped silently.
    ///
    /// # Safety
    /// Every replacement must be a function compatible with the symbol it
    /// replaces. Calls must not race with each other.
    pub unsafe fn register(&self, rebindings: &[Rebinding<'static>]) -> Result<()> {
        match REGISTRY.prepend(rebindings)? {
            Prepended::First => {
                #[cfg(feature = "log")]
                log::debug!("[Rebind] installing the image-load notifier");
                D::register_add_image(on_add_image::<D, M>);
                NOTIFIER_INSTALLED.store(true, Ordering::Release);
            }
            Prepended::Subsequent => {
                // Older batches are reapplied as well; the slot rewrite is idempotent.
                if let Some(head) = REGISTRY.head() {
                    for index in 0..D::image_count() {
                        if let Some(image) = D::image(index) {
                            unsafe { rebind_image::<D, M>(&image, head) };
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies `rebindings` to `image` only.
    ///
    /// Nothing is kept: the global registry is untouched and images loaded
    /// later are not affected.
    ///
    /// # Safety
    /// `image` must describe a Mach-O image mapped in this process, and every
    /// replacement must be compatible with the symbol it replaces.
    pub unsafe fn register_for_image(
        &self,
        image: LoadedImage,
        rebindings: &[Rebinding<'_>],
    ) -> Result<()> {
        let transient = TransientBatch::new(rebindings)?;
        unsafe { rebind_image::<D, M>(&image, &transient.as_batch()) };
        Ok(())
    }
}

/// Called by the loader for every image, present and future.
extern "C" fn on_add_image<D: Dyld, M: Mmap>(header: *const c_void, slide: isize) {
    if let Some(head) = REGISTRY.head() {
        unsafe { rebind_image::<D, M>(&LoadedImage::new(header, slide), head) };
    }
}

/// Rebinds every symbol pointer section of `image` against `batch`.
///
/// Returns the number of slots written. Layout problems skip the image and
/// protection problems skip the section; neither is reported to the caller.
unsafe fn rebind_image<D: Dyld, M: Mmap>(image: &LoadedImage, batch: &Batch<'_>) -> usize {
    if !D::contains(image.base()) {
        #[cfg(feature = "log")]
        log::debug!("[Rebind] 0x{:x} is not a loaded image, skipped", image.base());
        return 0;
    }
    let layout = match unsafe { ImageLayout::parse(image) } {
        Ok(layout) => layout,
        Err(_err) => {
            #[cfg(feature = "log")]
            log::debug!("[Rebind] image 0x{:x} skipped: {}", image.base(), _err);
            return 0;
        }
    };
    let mut rebound = 0;
    for section in layout.pointer_sections() {
        match unsafe { patch_section::<M>(&section, layout.tables(), image.slide(), batch) } {
            Ok(count) => rebound += count,
            Err(_err) => {
                #[cfg(feature = "log")]
                log::warn!(
                    "[Rebind] section at 0x{:x} in image 0x{:x} skipped: {}",
                    section.runtime_addr(image.slide()),
                    image.base(),
                    _err
                );
            }
        }
    }
    #[cfg(feature = "log")]
    log::trace!("[Rebind] image 0x{:x}: {} slots rebound", image.base(), rebound);
    rebound
}

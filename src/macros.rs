#![allow(unused)]

/// Macro to use for modules constrained to the raw ALSA backend.
macro_rules! cfg_alsa {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "alsa")]
            #[cfg_attr(docsrs, doc(
                cfg(feature = "alsa")
            ))]
            $item
        )*
    }
}

//! Generated protocol bindings that are not shipped by `wayland-protocols`.
//!
//! `wl_drm` is needed on both sides of the nest: the upstream compositor
//! publishes it and the nested server re-publishes it. `ivi_application` is
//! only consumed upstream.

#![allow(non_upper_case_globals, non_camel_case_types, clippy::all)]

pub mod drm {
    pub mod client {
        use wayland_client;
        use wayland_client::protocol::*;

        pub mod __interfaces {
            use wayland_client::protocol::__interfaces::*;
            wayland_scanner::generate_interfaces!("protocols/wayland-drm.xml");
        }
        use self::__interfaces::*;

        wayland_scanner::generate_client_code!("protocols/wayland-drm.xml");
    }

    pub mod server {
        use wayland_server;
        use wayland_server::protocol::*;

        pub mod __interfaces {
            use wayland_server::protocol::__interfaces::*;
            wayland_scanner::generate_interfaces!("protocols/wayland-drm.xml");
        }
        use self::__interfaces::*;

        wayland_scanner::generate_server_code!("protocols/wayland-drm.xml");
    }
}

pub mod ivi {
    pub mod client {
        use wayland_client;
        use wayland_client::protocol::*;

        pub mod __interfaces {
            use wayland_client::protocol::__interfaces::*;
            wayland_scanner::generate_interfaces!("protocols/ivi-application.xml");
        }
        use self::__interfaces::*;

        wayland_scanner::generate_client_code!("protocols/ivi-application.xml");
    }
}

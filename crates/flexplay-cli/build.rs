fn main() {
    // TARGET decides, not HOST
    let target = std::env::var( "CARGO_CFG_TARGET_OS" ).unwrap_or_default();
    if target != "windows" {
        return;
    }

    let mut res = winres::WindowsResource::new();
    if std::env::var( "CARGO_CFG_TARGET_ARCH" ).unwrap_or_default() == "x86_64" && cfg!( not( windows ) ) {
        res.set_windres_path( "x86_64-w64-mingw32-windres" );
    }

    res.set( "ProductName", "FlexPlay" );
    res.set( "FileDescription", "FlexPlay Music Player" );
    res.set( "OriginalFilename", "flexplay.exe" );
    if let Err( e ) = res.compile() {
        println!( "cargo:warning=Skipping Windows resources: {}", e );
    }
}

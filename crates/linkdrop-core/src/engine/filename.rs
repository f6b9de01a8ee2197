//! Target filename resolution

use linkdrop_types::LinkDescriptor;

/// Filename a link is saved under
///
/// Path separators inside the filename become `-` so the filename alone can
/// never create folders; the link's folder is prepended only when the batch
/// policy asks for it.
pub fn resolve_filename(link: &LinkDescriptor, create_folder: bool) -> String {
    let filename = link.filename.replace(['/', '\\'], "-");

    match link.folder.as_deref() {
        Some(folder) if create_folder && !folder.is_empty() => format!("{}/{}", folder, filename),
        _ => filename,
    }
}
